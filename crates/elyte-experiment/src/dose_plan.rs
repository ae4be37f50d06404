//! Splitting an ingredient volume into pipette-sized doses.

use elyte_core::error::{ElyteError, ElyteResult};

/// Sub-doses for `required_ul` with a pump that holds at most `max_dose_ul`.
///
/// The plan is `floor(required / max)` full doses followed by the remainder.
/// A remainder below `min_dose_ul` is dropped, so an exact multiple of the
/// dose limit produces only full doses and a zero requirement produces none.
pub fn plan_doses(required_ul: f64, max_dose_ul: f64, min_dose_ul: f64) -> ElyteResult<Vec<f64>> {
    if !max_dose_ul.is_finite() || max_dose_ul <= 0.0 {
        return Err(ElyteError::Config(format!(
            "max dose must be positive, got {}",
            max_dose_ul
        )));
    }
    if !min_dose_ul.is_finite() || min_dose_ul < 0.0 || min_dose_ul >= max_dose_ul {
        return Err(ElyteError::Config(format!(
            "minimum dose {} must lie in [0, {})",
            min_dose_ul, max_dose_ul
        )));
    }
    if !required_ul.is_finite() || required_ul < 0.0 {
        return Err(ElyteError::Config(format!(
            "dose volume must be a non-negative number, got {}",
            required_ul
        )));
    }

    let full = (required_ul / max_dose_ul).floor() as usize;
    let remainder = required_ul % max_dose_ul;

    let mut doses = vec![max_dose_ul; full];
    if remainder > 0.0 && remainder >= min_dose_ul {
        doses.push(remainder);
    }
    Ok(doses)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_above_limit() {
        assert_eq!(plan_doses(120.0, 100.0, 1.0).unwrap(), vec![100.0, 20.0]);
        assert_eq!(plan_doses(450.0, 200.0, 1.0).unwrap(), vec![200.0, 200.0, 50.0]);
    }

    #[test]
    fn test_below_and_at_limit() {
        assert_eq!(plan_doses(50.0, 100.0, 1.0).unwrap(), vec![50.0]);
        assert_eq!(plan_doses(200.0, 100.0, 1.0).unwrap(), vec![100.0, 100.0]);
        assert!(plan_doses(0.0, 100.0, 1.0).unwrap().is_empty());
    }

    #[test]
    fn test_sub_resolution_remainder_dropped() {
        assert_eq!(plan_doses(100.5, 100.0, 1.0).unwrap(), vec![100.0]);
        assert!(plan_doses(0.4, 100.0, 1.0).unwrap().is_empty());
        assert_eq!(plan_doses(101.0, 100.0, 1.0).unwrap(), vec![100.0, 1.0]);
    }

    #[test]
    fn test_zero_floor_keeps_fractional_remainder() {
        assert_eq!(plan_doses(100.5, 100.0, 0.0).unwrap(), vec![100.0, 0.5]);
        assert_eq!(plan_doses(200.0, 100.0, 0.0).unwrap(), vec![100.0, 100.0]);
    }

    #[test]
    fn test_doses_sum_to_requirement() {
        for required in [101.0, 199.0, 250.0, 333.0, 1000.0, 1234.0] {
            let plan = plan_doses(required, 100.0, 1.0).unwrap();
            let (last, full) = plan.split_last().unwrap();
            assert!(full.iter().all(|d| *d == 100.0));
            assert!(*last <= 100.0 && *last >= 1.0);
            assert_eq!(plan.iter().sum::<f64>(), required);
        }
    }

    #[test]
    fn test_invalid_inputs() {
        assert!(plan_doses(10.0, 0.0, 1.0).is_err());
        assert!(plan_doses(-1.0, 100.0, 1.0).is_err());
        assert!(plan_doses(f64::NAN, 100.0, 1.0).is_err());
        assert!(plan_doses(10.0, 100.0, -1.0).is_err());
        assert!(plan_doses(10.0, 100.0, 100.0).is_err());
    }
}
