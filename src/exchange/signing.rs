use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::BotError;
use crate::Result;

type HmacSha256 = Hmac<Sha256>;

/// Hex HMAC-SHA256 of the query string, as Binance expects in `signature=`
pub fn sign_query(secret: &str, query: &str) -> Result<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| BotError::InvalidSettings(format!("Invalid API secret: {}", e)))?;
    mac.update(query.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// `k=v&k=v` in insertion order. Values are symbols and plain decimals, so no escaping.
pub fn encode_params(params: &[(&str, String)]) -> String {
    params
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_signature() {
        // Worked example from the Binance API docs
        let secret = "NhqPtmdSJYdKjVHjA7PZj4Mge3R5YNiP1e3UZjInClVN65XAbvqqM6A7H5fATj0j";
        let query = "symbol=LTCBTC&side=BUY&type=LIMIT&timeInForce=GTC&quantity=1&price=0.1&recvWindow=5000&timestamp=1499827319559";

        assert_eq!(
            sign_query(secret, query).unwrap(),
            "c8db56825ae71d6d79447849e617115f4a920fa2acdcab2b053c4b2838bd6b71"
        );
    }

    #[test]
    fn test_encode_params_keeps_order() {
        let params = vec![("symbol", "SOLUSDT".to_string()), ("limit", "24".to_string())];
        assert_eq!(encode_params(&params), "symbol=SOLUSDT&limit=24");
    }
}
