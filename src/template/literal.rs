//! PowerShell literal formatting for rendered template values.

use minijinja::value::{Value, ValueKind};
use minijinja::{Error, ErrorKind, Output, State};

/// Characters PowerShell treats as a single quote inside verbatim strings.
pub(super) const SINGLE_QUOTES: [char; 5] = ['\'', '\u{2018}', '\u{2019}', '\u{201A}', '\u{201B}'];

/// Wraps `value` in a single-quoted PowerShell string, doubling every quote.
///
/// Single-quoted strings are verbatim in PowerShell: `$`, backticks, and
/// backslashes carry no meaning, so quotes are the only characters to escape.
#[must_use]
pub fn quote(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('\'');
    for ch in value.chars() {
        if SINGLE_QUOTES.contains(&ch) {
            out.push(ch);
        }
        out.push(ch);
    }
    out.push('\'');
    out
}

/// Converts forward slashes to the Windows separator.
#[must_use]
pub fn windows_path(value: &str) -> String {
    value.replace('/', "\\")
}

/// Renders `value` as a PowerShell expression.
///
/// Maps become hashtables with quoted keys, so `$vm.Name` reads a field of
/// a serialised struct.
///
/// # Errors
///
/// Returns an error for undefined values and for kinds with no literal form.
pub fn literal(value: &Value) -> Result<String, Error> {
    match value.kind() {
        ValueKind::None => Ok(String::from("$null")),
        ValueKind::Bool => Ok(String::from(if value.is_true() {
            "$true"
        } else {
            "$false"
        })),
        ValueKind::Number => Ok(value.to_string()),
        ValueKind::String if value.is_safe() => Ok(value.to_string()),
        ValueKind::String => Ok(quote(value.as_str().unwrap_or_default())),
        ValueKind::Seq | ValueKind::Iterable => {
            let items = value
                .try_iter()?
                .map(|item| literal(&item))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(format!("@({})", items.join(", ")))
        }
        ValueKind::Map => {
            let entries = value
                .try_iter()?
                .map(|key| {
                    let item = value.get_item(&key)?;
                    Ok(format!("{} = {}", quote(&key.to_string()), literal(&item)?))
                })
                .collect::<Result<Vec<_>, Error>>()?;
            if entries.is_empty() {
                return Ok(String::from("@{}"));
            }
            Ok(format!("@{{ {} }}", entries.join("; ")))
        }
        ValueKind::Undefined => Err(Error::new(
            ErrorKind::UndefinedError,
            "undefined value cannot be rendered",
        )),
        _ => Err(Error::new(
            ErrorKind::InvalidOperation,
            format!("a {:?} value has no PowerShell literal form", value.kind()),
        )),
    }
}

/// Template formatter emitting PowerShell literals for every `{{ }}` block.
pub(super) fn powershell_formatter(
    out: &mut Output<'_>,
    _state: &State<'_, '_>,
    value: &Value,
) -> Result<(), Error> {
    let text = literal(value)?;
    out.write_str(&text)
        .map_err(|err| Error::new(ErrorKind::WriteFailure, err.to_string()))
}
