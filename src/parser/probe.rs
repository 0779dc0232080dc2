use std::sync::LazyLock;

use regex::Regex;
use serde::de::IgnoredAny;

use super::error::ProbeError;

static NUMBER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^-?(?:0|[1-9][0-9]*)(?:\.[0-9]+)?(?:[eE][+-]?[0-9]+)?").unwrap());

const LITERALS: &[&str] = &["null", "true", "false"];

/// Length in bytes of the first JSON value in `input`, counting leading whitespace,
/// the value itself and the whitespace that trails it. Anything after that is ignored.
pub fn probe_len(input: &str) -> Result<usize, ProbeError> {
    let start = skip_ws(input, 0);
    let rest = &input[start..];

    let len = match rest.as_bytes().first() {
        None => return Err(ProbeError::NoValue),
        // Self-delimiting values: the stream deserializer stops right after the closing byte.
        Some(b'{' | b'[' | b'"') => {
            let mut stream = serde_json::Deserializer::from_str(rest).into_iter::<IgnoredAny>();
            match stream.next() {
                Some(Ok(_)) => stream.byte_offset(),
                Some(Err(e)) => return Err(ProbeError::Json(e)),
                None => return Err(ProbeError::NoValue),
            }
        }
        Some(_) => scalar_len(rest).ok_or(ProbeError::NoValue)?,
    };

    Ok(skip_ws(input, start + len))
}

/// Scalars are matched lexically so that `null` followed by an id still probes.
fn scalar_len(s: &str) -> Option<usize> {
    if let Some(lit) = LITERALS.iter().find(|lit| s.starts_with(**lit)) {
        return Some(lit.len());
    }
    NUMBER_RE.find(s).map(|m| m.end())
}

fn skip_ws(s: &str, from: usize) -> usize {
    let extra = s.as_bytes()[from..]
        .iter()
        .take_while(|b| matches!(b, b' ' | b'\t' | b'\n' | b'\r'))
        .count();
    from + extra
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_ignores_trailing_frames() {
        let s = r#"{"a":[1,2]}5:["$"]"#;
        assert_eq!(probe_len(s).unwrap(), 11);
    }

    #[test]
    fn counts_leading_and_trailing_whitespace() {
        assert_eq!(probe_len("  [1] \n x").unwrap(), 8);
    }

    #[test]
    fn string_value() {
        assert_eq!(probe_len(r#""a\"b"rest"#).unwrap(), 6);
    }

    #[test]
    fn null_followed_by_id() {
        assert_eq!(probe_len("null1f:{}").unwrap(), 4);
    }

    #[test]
    fn numbers() {
        assert_eq!(probe_len("-12.5e3,").unwrap(), 7);
        assert_eq!(probe_len("0x").unwrap(), 1);
    }

    #[test]
    fn plain_text_fails() {
        assert!(matches!(probe_len("hello world"), Err(ProbeError::NoValue)));
        assert!(matches!(probe_len(""), Err(ProbeError::NoValue)));
        assert!(matches!(probe_len("   "), Err(ProbeError::NoValue)));
    }

    #[test]
    fn unterminated_object_fails() {
        assert!(matches!(probe_len(r#"{"a":"#), Err(ProbeError::Json(_))));
    }

    #[test]
    fn chained_values_consume_each_once() {
        let values = [r#"{"k":"v"}"#, "[1, 2]", r#""s""#, "null", "42"];
        let buffer = values.join(" \n");
        let mut rest = buffer.as_str();
        let mut total = 0;
        let mut count = 0;
        while !rest.is_empty() {
            let n = probe_len(rest).unwrap();
            assert!(n > 0);
            total += n;
            count += 1;
            rest = &rest[n..];
        }
        assert_eq!(count, values.len());
        assert_eq!(total, buffer.len());
    }

    #[test]
    fn multibyte_content_measured_in_bytes() {
        let s = r#"{"n":"Zoë"}tail"#;
        let n = probe_len(s).unwrap();
        assert_eq!(&s[n..], "tail");
    }
}
