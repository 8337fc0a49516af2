//! Recharge notification parser
//!
//! Turns the free-form text the prepaid vendor sends after a purchase into a
//! [`RechargeEvent`]. A typical message:
//!
//! ```text
//! TOKEN 1234 5678 9012 3456 7890 2807.0KWH Cost 842100.00 VAT 18% 151578.00
//! EWURA 1% 8421.00 REA 3% 25263.00 TOTAL TZS 1,000,000.00 Date 2024-03-01 14:22
//! ```

use crate::core::{parse_timestamp, Error, RechargeEvent, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};

/// An itemised charge on the receipt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fee {
    pub name: String,
    pub amount: f64,
}

/// Structured fields extracted from one message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedRecharge {
    /// Token digits with separators removed
    pub token: String,
    pub kwh: f64,
    pub fees: Vec<Fee>,
    pub currency: String,
    pub total: f64,
    pub timestamp: i64,
}

impl ParsedRecharge {
    /// Build a recharge event, optionally already attributed to a run
    pub fn into_event(self, run_id: Option<i64>) -> RechargeEvent {
        RechargeEvent {
            id: None,
            run_id,
            token: Some(self.token),
            timestamp: self.timestamp,
            kwh_added: self.kwh,
            amount_paid: self.total,
            meter_after_kwh: None,
        }
    }
}

/// Compiled patterns for recharge messages
pub struct SmsParser {
    token: Regex,
    kwh: Regex,
    fee: Regex,
    total: Regex,
    date: Regex,
}

impl SmsParser {
    pub fn new() -> Result<Self> {
        Ok(Self {
            token: compile(r"(?i)\btoken\b[^\d]{0,12}(\d{4}(?:[\s-]?\d{4}){3,4})")?,
            kwh: compile(r"(?i)\b(\d[\d,]*(?:\.\d+)?)\s*kwh\b")?,
            fee: compile(
                r"(?i)\b(vat|ewura|rea|debt|cost)\b(?:\s+\d+(?:\.\d+)?%)?\s*:?\s*(?:tzs\s*)?(\d[\d,]*(?:\.\d+)?)",
            )?,
            total: compile(r"(?i)\btotal\b\s*:?\s*([a-z]{3})\s*(\d[\d,]*(?:\.\d+)?)")?,
            date: compile(r"(\d{4}-\d{2}-\d{2} \d{2}:\d{2})")?,
        })
    }

    /// Parse one message. Fails naming the first required field that is missing.
    pub fn parse(&self, text: &str) -> Result<ParsedRecharge> {
        let token = self
            .token
            .captures(text)
            .map(|c| c[1].chars().filter(char::is_ascii_digit).collect::<String>())
            .ok_or_else(|| missing("token"))?;

        let kwh = self
            .kwh
            .captures(text)
            .ok_or_else(|| missing("kWh quantity"))
            .and_then(|c| parse_number(&c[1]))?;

        let (currency, total) = match self.total.captures(text) {
            Some(c) => (c[1].to_uppercase(), parse_number(&c[2])?),
            None => return Err(missing("TOTAL amount")),
        };

        let timestamp = match self.date.captures(text) {
            Some(c) => parse_timestamp(&c[1])?,
            None => return Err(missing("date")),
        };

        let fees = self
            .fee
            .captures_iter(text)
            .map(|c| {
                Ok(Fee {
                    name: c[1].to_uppercase(),
                    amount: parse_number(&c[2])?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(ParsedRecharge {
            token,
            kwh,
            fees,
            currency,
            total,
            timestamp,
        })
    }
}

fn compile(pattern: &str) -> Result<Regex> {
    Regex::new(pattern).map_err(|e| Error::Parse(format!("invalid pattern: {}", e)))
}

fn missing(field: &str) -> Error {
    Error::Parse(format!("recharge message has no {}", field))
}

fn parse_number(raw: &str) -> Result<f64> {
    raw.replace(',', "")
        .parse::<f64>()
        .map_err(|e| Error::Parse(format!("invalid number '{}': {}", raw, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    const MESSAGE: &str = "TOKEN 1234 5678 9012 3456 7890 2807.0KWH Cost 842100.00 VAT 18% 151578.00 \
                           EWURA 1% 8421.00 REA 3% 25263.00 TOTAL TZS 1,000,000.00 Date 2024-03-01 14:22";

    #[test]
    fn test_parse_full_message() {
        let parser = SmsParser::new().unwrap();
        let parsed = parser.parse(MESSAGE).unwrap();

        assert_eq!(parsed.token, "12345678901234567890");
        assert_eq!(parsed.kwh, 2807.0);
        assert_eq!(parsed.currency, "TZS");
        assert_eq!(parsed.total, 1_000_000.0);
        assert_eq!(parsed.timestamp, 1709302920);

        let names: Vec<&str> = parsed.fees.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["COST", "VAT", "EWURA", "REA"]);
        assert_eq!(parsed.fees[1].amount, 151_578.0);
    }

    #[test]
    fn test_parse_minimal_message() {
        let parser = SmsParser::new().unwrap();
        let parsed = parser
            .parse("Token: 1111-2222-3333-4444-5555 Units 150.5 kWh. Total TZS 53,600 on 2024-02-10 08:05")
            .unwrap();

        assert_eq!(parsed.token, "11112222333344445555");
        assert_eq!(parsed.kwh, 150.5);
        assert_eq!(parsed.total, 53_600.0);
        assert!(parsed.fees.is_empty());
    }

    #[test]
    fn test_into_event() {
        let parser = SmsParser::new().unwrap();
        let event = parser.parse(MESSAGE).unwrap().into_event(Some(7));

        assert_eq!(event.run_id, Some(7));
        assert_eq!(event.kwh_added, 2807.0);
        assert_eq!(event.amount_paid, 1_000_000.0);
        assert_eq!(event.token.as_deref(), Some("12345678901234567890"));
        assert!(event.meter_after_kwh.is_none());
    }

    #[test]
    fn test_missing_fields() {
        let parser = SmsParser::new().unwrap();

        let err = parser.parse("TOKEN 1234 5678 9012 3456 7890 TOTAL TZS 500 2024-03-01 14:22");
        assert!(matches!(err, Err(Error::Parse(msg)) if msg.contains("kWh")));

        let err = parser.parse("TOKEN 1234 5678 9012 3456 7890 12KWH 2024-03-01 14:22");
        assert!(matches!(err, Err(Error::Parse(msg)) if msg.contains("TOTAL")));

        let err = parser.parse("TOKEN 1234 5678 9012 3456 7890 12KWH TOTAL TZS 500");
        assert!(matches!(err, Err(Error::Parse(msg)) if msg.contains("date")));

        let err = parser.parse("12KWH TOTAL TZS 500 2024-03-01 14:22");
        assert!(matches!(err, Err(Error::Parse(msg)) if msg.contains("token")));
    }
}
