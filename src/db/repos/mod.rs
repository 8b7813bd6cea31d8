pub mod agents;
pub mod healing;
pub mod heartbeats;
pub mod patterns;
pub mod suggestions;

/// Map an unparseable enum column onto a rusqlite conversion error. The CHECK
/// constraints make this unreachable for rows the engine wrote itself.
pub(crate) fn bad_enum(col: &str, val: &str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        0,
        rusqlite::types::Type::Text,
        format!("invalid {col}: {val}").into(),
    )
}

/// Same shape for malformed JSON columns.
pub(crate) fn bad_json(col: &str, err: serde_json::Error) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        0,
        rusqlite::types::Type::Text,
        format!("invalid {col}: {err}").into(),
    )
}
