//! Property coverage for CyclePoint/Interval arithmetic and Prerequisite
//! boolean evaluation, per the universally-quantified properties in
//! spec.md §8 (as opposed to the worked-example scenarios in
//! `scenario_s*.rs`).

use proptest::prelude::*;

use cylc_scheduler::cycle::{Calendar, CalendarDuration, CalendarInstant, CyclePoint, Interval};
use cylc_scheduler::prerequisite::{OutputValidator, Prerequisite};

struct AllKnown;
impl OutputValidator for AllKnown {
    fn task_exists(&self, _task_name: &str) -> bool {
        true
    }
    fn output_exists(&self, _task_name: &str, _output: &str) -> bool {
        true
    }
}

proptest! {
    #[test]
    fn integer_point_add_then_subtract_is_identity(start in -100_000i64..100_000, delta in -50_000i64..50_000) {
        let p = CyclePoint::integer(start);
        let iv = Interval::Integer(delta);
        let moved = p.add(&iv).unwrap();
        let back = moved.sub_interval(&iv).unwrap();
        prop_assert_eq!(back.compare(&p).unwrap(), std::cmp::Ordering::Equal);
    }

    #[test]
    fn integer_interval_addition_is_associative_via_cyclepoint(
        start in -10_000i64..10_000,
        a in -5_000i64..5_000,
        b in -5_000i64..5_000,
    ) {
        let p = CyclePoint::integer(start);
        let step_by_step = p.add(&Interval::Integer(a)).unwrap().add(&Interval::Integer(b)).unwrap();
        let combined = p.add(&Interval::Integer(a).add(&Interval::Integer(b)).unwrap()).unwrap();
        prop_assert_eq!(step_by_step.compare(&combined).unwrap(), std::cmp::Ordering::Equal);
    }

    #[test]
    fn fixed_length_calendar_day_offset_add_then_subtract_is_identity(
        year in 1i64..3000,
        month in 1u8..=12,
        day in 1u8..=30,
        delta_days in -5_000i64..5_000,
    ) {
        let p = CyclePoint::Calendar(CalendarInstant {
            calendar: Calendar::Day360,
            year,
            month,
            day,
            hour: 0,
            minute: 0,
            second: 0,
        });
        let iv = Interval::Calendar(CalendarDuration { days: delta_days, ..Default::default() });
        let moved = p.add(&iv).unwrap();
        let back = moved.sub_interval(&iv).unwrap();
        prop_assert_eq!(back.compare(&p).unwrap(), std::cmp::Ordering::Equal);
    }

    #[test]
    fn prerequisite_conjunction_matches_boolean_and(a in any::<bool>(), b in any::<bool>(), c in any::<bool>()) {
        let point = CyclePoint::integer(1);
        let mut pre = Prerequisite::parse("a:succeeded & b:succeeded & c:succeeded", &point, None, &AllKnown).unwrap();
        if a { pre.satisfy("a", &point, "succeeded", "a.1"); }
        if b { pre.satisfy("b", &point, "succeeded", "b.1"); }
        if c { pre.satisfy("c", &point, "succeeded", "c.1"); }
        prop_assert_eq!(pre.all_satisfied(), a && b && c);
    }

    #[test]
    fn prerequisite_disjunction_matches_boolean_or(a in any::<bool>(), b in any::<bool>()) {
        let point = CyclePoint::integer(1);
        let mut pre = Prerequisite::parse("a:succeeded | b:succeeded", &point, None, &AllKnown).unwrap();
        if a { pre.satisfy("a", &point, "succeeded", "a.1"); }
        if b { pre.satisfy("b", &point, "succeeded", "b.1"); }
        prop_assert_eq!(pre.all_satisfied(), a || b);
    }

    #[test]
    fn prerequisite_nested_expression_matches_boolean_shape(a in any::<bool>(), b in any::<bool>(), c in any::<bool>()) {
        let point = CyclePoint::integer(1);
        let mut pre = Prerequisite::parse(
            "(a:succeeded & b:succeeded) | c:succeeded",
            &point,
            None,
            &AllKnown,
        ).unwrap();
        if a { pre.satisfy("a", &point, "succeeded", "a.1"); }
        if b { pre.satisfy("b", &point, "succeeded", "b.1"); }
        if c { pre.satisfy("c", &point, "succeeded", "c.1"); }
        prop_assert_eq!(pre.all_satisfied(), (a && b) || c);
    }
}
