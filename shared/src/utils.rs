use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value;

// 时间工具函数
pub fn now_utc() -> DateTime<Utc> {
    Utc::now()
}

/// 当前 UTC 时间，自 Unix epoch 起的整数微秒
pub fn epoch_micros() -> u64 {
    Utc::now().timestamp_micros() as u64
}

/// ISO-8601 UTC 字符串，微秒精度，Z 后缀
pub fn iso_utc(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

// 命令负载真值判断，与 JSON 值的通用真值语义一致
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn test_epoch_micros_magnitude() {
        let micros = epoch_micros();
        // 2020-01-01 之后，微秒量级
        assert!(micros > 1_577_836_800_000_000);
    }

    #[test]
    fn test_iso_utc_format() {
        let dt = Utc.with_ymd_and_hms(2025, 6, 1, 12, 30, 45).unwrap();
        let formatted = iso_utc(dt);
        assert_eq!(formatted, "2025-06-01T12:30:45.000000Z");
        assert!(formatted.ends_with('Z'));
    }

    #[test]
    fn test_is_truthy() {
        assert!(is_truthy(&json!(true)));
        assert!(is_truthy(&json!(1)));
        assert!(is_truthy(&json!(-3.5)));
        assert!(is_truthy(&json!("yes")));
        assert!(is_truthy(&json!([1])));
        assert!(is_truthy(&json!({"a": 1})));

        assert!(!is_truthy(&json!(false)));
        assert!(!is_truthy(&json!(0)));
        assert!(!is_truthy(&json!(0.0)));
        assert!(!is_truthy(&json!("")));
        assert!(!is_truthy(&json!([])));
        assert!(!is_truthy(&json!({})));
        assert!(!is_truthy(&json!(null)));
    }
}
