//! Missing-data imputation (C7): strategies to repair the NaN runs a
//! [`crate::scheduler`] interval leaves behind for sources that missed
//! their deadline.

use crate::error::{Result, SensorError};
use crate::model::Model;

/// Replaces every NaN entry with `0.0`.
pub fn zero(row: &mut [f64]) {
    for v in row.iter_mut() {
        if v.is_nan() {
            *v = 0.0;
        }
    }
}

/// Replaces every NaN entry with the corresponding column of
/// `model.avg`. Requires a calibrated model of matching width.
pub fn mean(row: &mut [f64], model: &Model) -> Result<()> {
    if row.len() != model.m() {
        return Err(SensorError::Imputation(format!(
            "row width {} does not match model width {}",
            row.len(),
            model.m()
        )));
    }
    for (v, avg) in row.iter_mut().zip(model.avg.iter()) {
        if v.is_nan() {
            *v = *avg;
        }
    }
    Ok(())
}

/// Named strategy lookup, open for extension the way `Sensor.missingData`
/// selects one by name out of a configured list.
pub fn apply(strategy: &str, row: &mut [f64], model: Option<&Model>) -> Result<()> {
    match strategy {
        "zero" => {
            zero(row);
            Ok(())
        }
        "mean" => {
            let model = model.ok_or_else(|| {
                SensorError::Imputation("mean imputation requires a calibrated model".into())
            })?;
            mean(row, model)
        }
        other => Err(SensorError::Imputation(format!("unknown imputation strategy '{other}'"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_replaces_nan_only() {
        let mut row = vec![1.0, f64::NAN, 3.0];
        zero(&mut row);
        assert_eq!(row, vec![1.0, 0.0, 3.0]);
    }

    #[test]
    fn mean_requires_matching_width() {
        let model = crate::model::calibrate_static(
            &nalgebra::DMatrix::from_element(4, 2, 1.0),
            1,
            2,
            2,
            0.01,
            "t0",
        )
        .unwrap();
        let mut row = vec![f64::NAN];
        assert!(mean(&mut row, &model).is_err());
    }

    #[test]
    fn apply_rejects_unknown_strategy() {
        let mut row = vec![1.0];
        assert!(apply("bogus", &mut row, None).is_err());
    }
}
