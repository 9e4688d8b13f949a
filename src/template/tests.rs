//! Unit tests for template rendering.

use super::*;
use rstest::{fixture, rstest};
use serde::Serialize;

const LOOKUP: ScriptTemplate = ScriptTemplate::new(
    "lookup",
    &["path", "size", "fixed", "tags", "parent"],
    "$path = {{ path | winpath }}\n$size = {{ size }}\n$fixed = {{ fixed }}\n$tags = {{ tags }}\n$parent = {{ parent }}",
);

#[derive(Serialize)]
struct LookupArgs<'a> {
    path: &'a str,
    size: u64,
    fixed: bool,
    tags: Vec<&'a str>,
    parent: Option<&'a str>,
}

#[fixture]
fn catalog() -> ScriptCatalog {
    ScriptCatalog::new(&[LOOKUP]).expect("catalog should build")
}

/// Reverses [`quote`] the way PowerShell reads a verbatim string.
fn unquote(text: &str) -> String {
    let inner = text
        .strip_prefix('\'')
        .and_then(|rest| rest.strip_suffix('\''))
        .expect("literal should be single-quoted");
    let mut out = String::new();
    let mut chars = inner.chars();
    while let Some(ch) = chars.next() {
        if literal::SINGLE_QUOTES.contains(&ch) {
            assert_eq!(chars.next(), Some(ch), "quote must be doubled in {text}");
        }
        out.push(ch);
    }
    out
}

#[rstest]
fn renders_type_appropriate_literals(catalog: ScriptCatalog) {
    let script = catalog
        .render(
            &LOOKUP,
            &LookupArgs {
                path: "C:/VMs/disk.vhdx",
                size: 4096,
                fixed: true,
                tags: vec!["a", "b"],
                parent: None,
            },
        )
        .expect("render should succeed");
    assert_eq!(
        script,
        "$path = 'C:\\VMs\\disk.vhdx'\n$size = 4096\n$fixed = $true\n$tags = @('a', 'b')\n$parent = $null"
    );
}

#[rstest]
fn rendering_is_pure(catalog: ScriptCatalog) {
    let args = LookupArgs {
        path: "D:\\iso\\seed.iso",
        size: 0,
        fixed: false,
        tags: Vec::new(),
        parent: Some("D:\\base.vhdx"),
    };
    let first = catalog.render(&LOOKUP, &args).expect("first render");
    let second = catalog.render(&LOOKUP, &args).expect("second render");
    assert_eq!(first, second);
    assert!(!first.contains("{{"));
    assert!(!first.contains("}}"));
}

#[rstest]
#[case("plain")]
#[case("O'Brien")]
#[case("it''s")]
#[case("C:\\path with spaces\\")]
#[case("$env:TEMP `n \"quoted\"")]
#[case("smart \u{2019}quote\u{2018} and \u{201A}\u{201B}")]
#[case("")]
fn quoting_round_trips(#[case] value: &str) {
    assert_eq!(unquote(&quote(value)), value);
}

#[rstest]
fn missing_argument_is_a_validation_error(catalog: ScriptCatalog) {
    #[derive(Serialize)]
    struct Partial {
        path: String,
    }
    let err = catalog
        .render(
            &LOOKUP,
            &Partial {
                path: String::from("x"),
            },
        )
        .expect_err("missing fields must fail");
    assert!(matches!(err, HypervError::Validation { ref field, .. } if field == "lookup"));
}

#[test]
fn undeclared_placeholder_fails_at_startup() {
    let broken = ScriptTemplate::new("broken", &["path"], "{{ path }} {{ pth }}");
    let err = ScriptCatalog::new(&[broken]).expect_err("typo must be caught");
    assert_eq!(
        err,
        TemplateError::UndeclaredPlaceholder {
            name: String::from("broken"),
            placeholder: String::from("pth"),
        }
    );
}

#[test]
fn unused_parameter_fails_at_startup() {
    let broken = ScriptTemplate::new("unused", &["path", "size"], "{{ path }}");
    let err = ScriptCatalog::new(&[broken]).expect_err("unused param must be caught");
    assert!(matches!(err, TemplateError::UnusedParameter { ref param, .. } if param == "size"));
}

#[test]
fn syntax_error_fails_at_startup() {
    let broken = ScriptTemplate::new("syntax", &[], "{% if %}");
    let err = ScriptCatalog::new(&[broken]).expect_err("bad syntax must be caught");
    assert!(matches!(err, TemplateError::Syntax { .. }));
}

#[test]
fn duplicate_names_are_rejected() {
    let err = ScriptCatalog::new(&[LOOKUP, LOOKUP]).expect_err("duplicate must fail");
    assert_eq!(err, TemplateError::Duplicate(String::from("lookup")));
}

#[test]
fn structs_render_as_hashtables() {
    #[derive(Serialize)]
    #[serde(rename_all = "PascalCase")]
    struct Adapter<'a> {
        name: &'a str,
        vlan_id: u32,
        addresses: Vec<&'a str>,
    }
    #[derive(Serialize)]
    struct AdapterArgs<'a> {
        adapter: Adapter<'a>,
    }

    let template = ScriptTemplate::new("adapter", &["adapter"], "$adapter = {{ adapter }}");
    let catalog = ScriptCatalog::new(&[template]).expect("catalog should build");
    let script = catalog
        .render(
            &template,
            &AdapterArgs {
                adapter: Adapter {
                    name: "wan's",
                    vlan_id: 12,
                    addresses: vec!["10.0.0.1"],
                },
            },
        )
        .expect("render should succeed");
    let body = script
        .strip_prefix("$adapter = @{ ")
        .and_then(|rest| rest.strip_suffix(" }"))
        .expect("hashtable literal");
    let mut entries: Vec<&str> = body.split("; ").collect();
    entries.sort_unstable();
    assert_eq!(
        entries,
        ["'Addresses' = @('10.0.0.1')", "'Name' = 'wan''s'", "'VlanId' = 12"]
    );
}
