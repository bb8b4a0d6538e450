//! Conversion of decoded register values into published engineering values.

use crate::error::NormalizationError;
use crate::register_map::Quantity;

/// The power register reports consumption as positive, published power is
/// generation positive. Inversion is applied to every value, zero included.
pub fn normalize_power(raw: f64) -> Result<f64, NormalizationError> {
    check_finite(Quantity::Power, raw)?;
    Ok(raw * -1.0)
}

/// Cumulative exported energy in Wh, passed through after validation.
pub fn normalize_exported(raw: f64) -> Result<f64, NormalizationError> {
    check_finite(Quantity::Exported, raw)?;
    if raw < 0.0 {
        return Err(NormalizationError::OutOfRange {
            quantity: Quantity::Exported.name(),
            value: raw,
        });
    }
    Ok(raw)
}

fn check_finite(quantity: Quantity, value: f64) -> Result<(), NormalizationError> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(NormalizationError::NotFinite {
            quantity: quantity.name(),
            value,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_power_is_inverted() {
        assert_eq!(normalize_power(150.0), Ok(-150.0));
        assert_eq!(normalize_power(-200.0), Ok(200.0));
    }

    #[test]
    fn test_power_inversion_is_exact() {
        for raw in i16::MIN..=i16::MAX {
            let raw = raw as f64;
            assert_eq!(normalize_power(raw).unwrap(), -raw);
        }
    }

    #[test]
    fn test_power_zero_is_inverted_too() {
        let power = normalize_power(0.0).unwrap();
        assert_eq!(power, 0.0);
        assert!(power.is_sign_negative());
    }

    #[test]
    fn test_power_not_finite() {
        assert!(matches!(
            normalize_power(f64::NAN),
            Err(NormalizationError::NotFinite {
                quantity: "power",
                ..
            })
        ));
        assert!(normalize_power(f64::INFINITY).is_err());
    }

    #[test]
    fn test_exported_pass_through() {
        assert_eq!(normalize_exported(0.0), Ok(0.0));
        assert_eq!(normalize_exported(1000.5), Ok(1000.5));
    }

    #[test]
    fn test_exported_rejects_invalid() {
        assert_eq!(
            normalize_exported(-1.0),
            Err(NormalizationError::OutOfRange {
                quantity: "exported",
                value: -1.0
            })
        );
        assert!(normalize_exported(f64::NAN).is_err());
        assert!(normalize_exported(f64::NEG_INFINITY).is_err());
    }
}
