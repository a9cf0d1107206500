//! Reply builders: raw reply → typed command value
//!
//! Error replies never reach a builder; `Response::get` turns them into
//! `CommandError::Server` first.

use std::collections::HashMap;

use crate::utils::{CommandError, RespValue};

type Built<T> = Result<T, CommandError>;

/// `+OK`
pub fn status_ok(raw: RespValue) -> Built<()> {
    match raw {
        RespValue::Status(s) if s == "OK" => Ok(()),
        other => Err(CommandError::unexpected("OK", other)),
    }
}

/// Any simple string (e.g. TYPE)
pub fn status(raw: RespValue) -> Built<String> {
    match raw {
        RespValue::Status(s) => Ok(s),
        other => Err(CommandError::unexpected("status", other)),
    }
}

pub fn integer(raw: RespValue) -> Built<i64> {
    match raw {
        RespValue::Integer(n) => Ok(n),
        other => Err(CommandError::unexpected("integer", other)),
    }
}

/// Integer reply read as a flag (1 = true)
pub fn boolean(raw: RespValue) -> Built<bool> {
    integer(raw).map(|n| n == 1)
}

/// Bulk string that may be nil
pub fn optional_bytes(raw: RespValue) -> Built<Option<Vec<u8>>> {
    match raw {
        RespValue::Bulk(value) => Ok(value),
        other => Err(CommandError::unexpected("bulk string", other)),
    }
}

/// Array of non-nil bulk strings
pub fn bytes_list(raw: RespValue) -> Built<Vec<Vec<u8>>> {
    match raw {
        RespValue::Array(Some(items)) => items
            .into_iter()
            .map(|item| match item {
                RespValue::Bulk(Some(b)) => Ok(b),
                other => Err(CommandError::unexpected("bulk string", other)),
            })
            .collect(),
        RespValue::Array(None) => Ok(Vec::new()),
        other => Err(CommandError::unexpected("array", other)),
    }
}

/// Array of bulk strings, nil entries kept as `None` (MGET)
pub fn optional_bytes_list(raw: RespValue) -> Built<Vec<Option<Vec<u8>>>> {
    match raw {
        RespValue::Array(Some(items)) => items.into_iter().map(optional_bytes).collect(),
        other => Err(CommandError::unexpected("array", other)),
    }
}

/// Flat field/value array (HGETALL)
pub fn byte_map(raw: RespValue) -> Built<HashMap<Vec<u8>, Vec<u8>>> {
    let items = bytes_list(raw)?;
    if items.len() % 2 != 0 {
        return Err(CommandError::unexpected(
            "even number of elements",
            items.len(),
        ));
    }
    let mut map = HashMap::with_capacity(items.len() / 2);
    let mut iter = items.into_iter();
    while let (Some(field), Some(value)) = (iter.next(), iter.next()) {
        map.insert(field, value);
    }
    Ok(map)
}

/// `[key, value]` or nil (BLPOP)
pub fn key_value(raw: RespValue) -> Built<Option<(Vec<u8>, Vec<u8>)>> {
    match raw {
        RespValue::Array(None) => Ok(None),
        RespValue::Array(Some(_)) => {
            let mut items = bytes_list(raw)?.into_iter();
            match (items.next(), items.next(), items.next()) {
                (Some(key), Some(value), None) => Ok(Some((key, value))),
                _ => Err(CommandError::unexpected("two-element array", "other length")),
            }
        }
        other => Err(CommandError::unexpected("array", other)),
    }
}

/// Reply as-is
pub fn raw(raw: RespValue) -> Built<RespValue> {
    Ok(raw)
}
