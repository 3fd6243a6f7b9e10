//! Parsers for the backend messages the replication client consumes
//! outside of copy-both mode: error/notice fields, authentication
//! requests, and simple-query result rows.

use bytes::{Buf, Bytes};

use crate::error::{Error, Result, ServerError};

/// Parse an ErrorResponse or NoticeResponse payload.
///
/// Both share the same layout: `(field_code, cstring)*` terminated by a
/// zero byte. Only the message (`M`) and SQLSTATE (`C`) fields matter to
/// this client; everything else is dropped.
pub fn parse_error_fields(payload: &[u8]) -> ServerError {
    let mut b = payload;
    let mut message = None;
    let mut sqlstate = None;

    while !b.is_empty() {
        let code = b[0];
        b = &b[1..];
        if code == 0 {
            break;
        }
        let Some(pos) = b.iter().position(|&x| x == 0) else {
            break;
        };
        let value = String::from_utf8_lossy(&b[..pos]).to_string();
        match code {
            b'M' => message = Some(value),
            b'C' => sqlstate = Some(value),
            _ => {}
        }
        b = &b[pos + 1..];
    }

    ServerError {
        message: message.unwrap_or_else(|| "unknown server error".to_string()),
        sqlstate,
    }
}

/// Split an AuthenticationRequest payload into its code and trailing data.
pub fn parse_auth_request(payload: &[u8]) -> Result<(i32, &[u8])> {
    if payload.len() < 4 {
        return Err(Error::Protocol("auth request too short".into()));
    }
    let mut b = payload;
    let code = b.get_i32();
    Ok((code, b))
}

/// One row of a simple-query result, with values as text.
///
/// Replication-mode connections only support the simple query protocol,
/// where every value arrives in text format; that is all
/// `IDENTIFY_SYSTEM` and `CREATE_REPLICATION_SLOT` need.
#[derive(Debug, Clone)]
pub struct SimpleQueryRow {
    columns: Vec<String>,
    values: Vec<Option<String>>,
}

impl SimpleQueryRow {
    pub fn new(columns: Vec<String>, values: Vec<Option<String>>) -> Self {
        Self { columns, values }
    }

    /// Value of the named column; `None` for SQL NULL or a missing column.
    pub fn get(&self, column: &str) -> Option<&str> {
        let idx = self.columns.iter().position(|c| c == column)?;
        self.values.get(idx)?.as_deref()
    }
}

/// Parse a RowDescription ('T') payload into column names.
pub fn parse_row_description(payload: &Bytes) -> Result<Vec<String>> {
    let mut b = payload.clone();
    if b.remaining() < 2 {
        return Err(Error::Protocol("RowDescription payload too short".into()));
    }
    let nfields = b.get_i16();
    let mut columns = Vec::with_capacity(nfields.max(0) as usize);

    for _ in 0..nfields {
        let name = read_cstring(&mut b)?;
        // table oid (4) + attnum (2) + type oid (4) + typlen (2) +
        // atttypmod (4) + format (2)
        if b.remaining() < 18 {
            return Err(Error::Protocol("RowDescription field truncated".into()));
        }
        b.advance(18);
        columns.push(name);
    }
    Ok(columns)
}

/// Parse a DataRow ('D') payload into text values (`None` = SQL NULL).
pub fn parse_data_row(payload: &Bytes) -> Result<Vec<Option<String>>> {
    let mut b = payload.clone();
    if b.remaining() < 2 {
        return Err(Error::Protocol("DataRow payload too short".into()));
    }
    let ncols = b.get_i16();
    let mut values = Vec::with_capacity(ncols.max(0) as usize);

    for _ in 0..ncols {
        if b.remaining() < 4 {
            return Err(Error::Protocol("DataRow column truncated".into()));
        }
        let len = b.get_i32();
        if len < 0 {
            values.push(None);
            continue;
        }
        let len = len as usize;
        if b.remaining() < len {
            return Err(Error::Protocol("DataRow value truncated".into()));
        }
        let raw = b.copy_to_bytes(len);
        values.push(Some(String::from_utf8_lossy(&raw).to_string()));
    }
    Ok(values)
}

fn read_cstring(b: &mut Bytes) -> Result<String> {
    let pos = b
        .iter()
        .position(|&x| x == 0)
        .ok_or_else(|| Error::Protocol("unterminated string in backend message".into()))?;
    let s = String::from_utf8_lossy(&b[..pos]).to_string();
    b.advance(pos + 1);
    Ok(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_fields_prefer_message_and_sqlstate() {
        // 'S' "ERROR" \0 'C' "55006" \0 'M' "replication slot is active" \0 \0
        let mut payload = Vec::new();
        payload.extend_from_slice(b"SERROR\0");
        payload.extend_from_slice(b"C55006\0");
        payload.extend_from_slice(b"Mreplication slot is active\0");
        payload.push(0);

        let err = parse_error_fields(&payload);
        assert_eq!(err.message, "replication slot is active");
        assert_eq!(err.sqlstate.as_deref(), Some("55006"));
    }

    #[test]
    fn error_fields_tolerate_missing_message() {
        let err = parse_error_fields(&[0]);
        assert_eq!(err.message, "unknown server error");
        assert!(err.sqlstate.is_none());
    }

    #[test]
    fn auth_request_splits_code_and_rest() {
        let mut payload = 10i32.to_be_bytes().to_vec();
        payload.extend_from_slice(b"SCRAM-SHA-256\0\0");
        let (code, rest) = parse_auth_request(&payload).unwrap();
        assert_eq!(code, 10);
        assert!(rest.starts_with(b"SCRAM-SHA-256"));
    }

    fn row_description(names: &[&str]) -> Bytes {
        let mut v = (names.len() as i16).to_be_bytes().to_vec();
        for name in names {
            v.extend_from_slice(name.as_bytes());
            v.push(0);
            v.extend_from_slice(&[0u8; 18]);
        }
        Bytes::from(v)
    }

    fn data_row(values: &[Option<&str>]) -> Bytes {
        let mut v = (values.len() as i16).to_be_bytes().to_vec();
        for value in values {
            match value {
                Some(s) => {
                    v.extend_from_slice(&(s.len() as i32).to_be_bytes());
                    v.extend_from_slice(s.as_bytes());
                }
                None => v.extend_from_slice(&(-1i32).to_be_bytes()),
            }
        }
        Bytes::from(v)
    }

    #[test]
    fn simple_query_row_lookup_by_name() {
        let columns = parse_row_description(&row_description(&[
            "systemid", "timeline", "xlogpos", "dbname",
        ]))
        .unwrap();
        let values = parse_data_row(&data_row(&[
            Some("7021"),
            Some("1"),
            Some("0/1A2B3C00"),
            None,
        ]))
        .unwrap();

        let row = SimpleQueryRow::new(columns, values);
        assert_eq!(row.get("xlogpos"), Some("0/1A2B3C00"));
        assert_eq!(row.get("dbname"), None);
        assert_eq!(row.get("nonexistent"), None);
    }

    #[test]
    fn data_row_rejects_truncated_value() {
        let mut v = 1i16.to_be_bytes().to_vec();
        v.extend_from_slice(&100i32.to_be_bytes());
        v.extend_from_slice(b"short");
        assert!(parse_data_row(&Bytes::from(v)).is_err());
    }
}
