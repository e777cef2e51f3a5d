use rust_decimal::prelude::*;
use rust_decimal::Decimal;

/// Price and quantity increments for one symbol
#[derive(Debug, Clone, PartialEq)]
pub struct SymbolRules {
    pub tick_size: Decimal,
    pub step_size: Decimal,
    pub min_qty: Decimal,
}

impl Default for SymbolRules {
    /// Used for symbols missing from exchange info
    fn default() -> Self {
        Self::from_precision(6, 3)
    }
}

impl SymbolRules {
    pub fn from_precision(price_decimals: u32, quantity_decimals: u32) -> Self {
        let step_size = Decimal::new(1, quantity_decimals);
        Self {
            tick_size: Decimal::new(1, price_decimals),
            step_size,
            min_qty: step_size,
        }
    }

    /// Build from the string filters of `/fapi/v1/exchangeInfo`
    pub fn from_filters(tick_size: &str, step_size: &str, min_qty: Option<&str>) -> Option<Self> {
        let tick_size = Decimal::from_str(tick_size).ok()?;
        let step_size = Decimal::from_str(step_size).ok()?;
        let min_qty = match min_qty {
            Some(raw) => Decimal::from_str(raw).ok()?,
            None => step_size,
        };
        Some(Self {
            tick_size,
            step_size,
            min_qty,
        })
    }

    pub fn round_price(&self, price: f64) -> f64 {
        floor_to_increment(price, self.tick_size)
    }

    /// Floor to the lot step; anything under the minimum quantity becomes 0
    pub fn round_quantity(&self, quantity: f64) -> f64 {
        let rounded = floor_to_increment(quantity, self.step_size);
        match Decimal::from_f64(rounded) {
            Some(d) if d >= self.min_qty => rounded,
            _ => 0.0,
        }
    }
}

/// Floor `value` to a whole multiple of `increment`.
///
/// Non-finite or non-positive input yields 0.
pub fn floor_to_increment(value: f64, increment: Decimal) -> f64 {
    if !value.is_finite() || value <= 0.0 || increment <= Decimal::ZERO {
        return 0.0;
    }

    let Some(value) = Decimal::from_f64(value) else {
        return 0.0;
    };

    let floored = (value / increment).floor() * increment;
    floored.normalize().to_f64().unwrap_or(0.0)
}

/// Plain decimal string for request parameters (no exponent notation)
pub fn format_decimal(value: f64) -> String {
    match Decimal::from_f64(value) {
        Some(d) => d.normalize().to_string(),
        None => "0".to_string(),
    }
}
