//! WS-Management SOAP envelopes for the Windows remote shell.

use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use roxmltree::{Document, Node};
use uuid::Uuid;

const SHELL_URI: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/cmd";
const ACTION_CREATE: &str = "http://schemas.xmlsoap.org/ws/2004/09/transfer/Create";
const ACTION_DELETE: &str = "http://schemas.xmlsoap.org/ws/2004/09/transfer/Delete";
const ACTION_COMMAND: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/Command";
const ACTION_RECEIVE: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/Receive";
const ACTION_SIGNAL: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/Signal";
const SIGNAL_TERMINATE: &str =
    "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/signal/terminate";
const STATE_DONE_SUFFIX: &str = "CommandState/Done";

/// WS-Management fault code for an expired `OperationTimeout`.
pub(super) const OPERATION_TIMEOUT_CODE: &str = "2150858793";

const MAX_ENVELOPE_SIZE: u32 = 153_600;

/// Escapes text for element content and attribute values.
pub(super) fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            other => out.push(other),
        }
    }
    out
}

fn iso_seconds(timeout: Duration) -> String {
    format!("PT{}S", timeout.as_secs().max(1))
}

struct Envelope<'a> {
    endpoint: &'a str,
    action: &'a str,
    shell_id: Option<&'a str>,
    options: &'a [(&'a str, &'a str)],
    timeout: Duration,
    body: String,
}

impl Envelope<'_> {
    fn render(&self) -> String {
        let mut xml = String::with_capacity(2048 + self.body.len());
        xml.push_str(concat!(
            r#"<s:Envelope xmlns:s="http://www.w3.org/2003/05/soap-envelope""#,
            r#" xmlns:a="http://schemas.xmlsoap.org/ws/2004/08/addressing""#,
            r#" xmlns:w="http://schemas.dmtf.org/wbem/wsman/1/wsman.xsd""#,
            r#" xmlns:p="http://schemas.microsoft.com/wbem/wsman/1/wsman.xsd""#,
            r#" xmlns:rsp="http://schemas.microsoft.com/wbem/wsman/1/windows/shell">"#,
            "<s:Header>"
        ));
        xml.push_str(&format!(
            concat!(
                "<a:To>{to}</a:To>",
                r#"<a:ReplyTo><a:Address s:mustUnderstand="true">"#,
                "http://schemas.xmlsoap.org/ws/2004/08/addressing/role/anonymous",
                "</a:Address></a:ReplyTo>",
                r#"<w:MaxEnvelopeSize s:mustUnderstand="true">{max}</w:MaxEnvelopeSize>"#,
                "<a:MessageID>uuid:{id}</a:MessageID>",
                r#"<w:Locale xml:lang="en-US" s:mustUnderstand="false"/>"#,
                r#"<p:DataLocale xml:lang="en-US" s:mustUnderstand="false"/>"#,
                "<w:OperationTimeout>{timeout}</w:OperationTimeout>",
                r#"<w:ResourceURI s:mustUnderstand="true">{resource}</w:ResourceURI>"#,
                r#"<a:Action s:mustUnderstand="true">{action}</a:Action>"#
            ),
            to = escape(self.endpoint),
            max = MAX_ENVELOPE_SIZE,
            id = Uuid::new_v4().hyphenated(),
            timeout = iso_seconds(self.timeout),
            resource = SHELL_URI,
            action = self.action,
        ));
        if let Some(shell_id) = self.shell_id {
            xml.push_str(&format!(
                r#"<w:SelectorSet><w:Selector Name="ShellId">{}</w:Selector></w:SelectorSet>"#,
                escape(shell_id)
            ));
        }
        if !self.options.is_empty() {
            xml.push_str("<w:OptionSet>");
            for (name, value) in self.options {
                xml.push_str(&format!(r#"<w:Option Name="{name}">{value}</w:Option>"#));
            }
            xml.push_str("</w:OptionSet>");
        }
        xml.push_str("</s:Header><s:Body>");
        xml.push_str(&self.body);
        xml.push_str("</s:Body></s:Envelope>");
        xml
    }
}

/// Request opening a `cmd` shell with UTF-8 output.
pub(super) fn create_shell(endpoint: &str, timeout: Duration) -> String {
    Envelope {
        endpoint,
        action: ACTION_CREATE,
        shell_id: None,
        options: &[("WINRS_NOPROFILE", "TRUE"), ("WINRS_CODEPAGE", "65001")],
        timeout,
        body: String::from(concat!(
            "<rsp:Shell><rsp:InputStreams>stdin</rsp:InputStreams>",
            "<rsp:OutputStreams>stdout stderr</rsp:OutputStreams></rsp:Shell>"
        )),
    }
    .render()
}

/// Request starting `command_line` inside an open shell.
pub(super) fn command(
    endpoint: &str,
    shell_id: &str,
    command_line: &str,
    timeout: Duration,
) -> String {
    Envelope {
        endpoint,
        action: ACTION_COMMAND,
        shell_id: Some(shell_id),
        options: &[
            ("WINRS_CONSOLEMODE_STDIN", "TRUE"),
            ("WINRS_SKIP_CMD_SHELL", "FALSE"),
        ],
        timeout,
        body: format!(
            "<rsp:CommandLine><rsp:Command>{}</rsp:Command></rsp:CommandLine>",
            escape(command_line)
        ),
    }
    .render()
}

/// Request polling output of a running command.
pub(super) fn receive(
    endpoint: &str,
    shell_id: &str,
    command_id: &str,
    timeout: Duration,
) -> String {
    Envelope {
        endpoint,
        action: ACTION_RECEIVE,
        shell_id: Some(shell_id),
        options: &[("WSMAN_CMDSHELL_OPTION_KEEPALIVE", "TRUE")],
        timeout,
        body: format!(
            r#"<rsp:Receive><rsp:DesiredStream CommandId="{}">stdout stderr</rsp:DesiredStream></rsp:Receive>"#,
            escape(command_id)
        ),
    }
    .render()
}

/// Request terminating a command.
pub(super) fn signal_terminate(
    endpoint: &str,
    shell_id: &str,
    command_id: &str,
    timeout: Duration,
) -> String {
    Envelope {
        endpoint,
        action: ACTION_SIGNAL,
        shell_id: Some(shell_id),
        options: &[],
        timeout,
        body: format!(
            r#"<rsp:Signal CommandId="{}"><rsp:Code>{SIGNAL_TERMINATE}</rsp:Code></rsp:Signal>"#,
            escape(command_id)
        ),
    }
    .render()
}

/// Request closing a shell.
pub(super) fn delete_shell(endpoint: &str, shell_id: &str, timeout: Duration) -> String {
    Envelope {
        endpoint,
        action: ACTION_DELETE,
        shell_id: Some(shell_id),
        options: &[],
        timeout,
        body: String::new(),
    }
    .render()
}

/// Output collected from one `Receive` response.
#[derive(Debug, Default, PartialEq, Eq)]
pub(super) struct ReceiveChunk {
    pub(super) stdout: Vec<u8>,
    pub(super) stderr: Vec<u8>,
    pub(super) done: bool,
    pub(super) exit_code: Option<i64>,
}

/// SOAP fault returned instead of a response body.
#[derive(Debug, PartialEq, Eq)]
pub(super) struct Fault {
    pub(super) code: Option<String>,
    pub(super) reason: String,
}

impl Fault {
    /// Whether the fault only reports that a poll found no new output.
    pub(super) fn is_operation_timeout(&self) -> bool {
        self.code.as_deref() == Some(OPERATION_TIMEOUT_CODE)
            || self.reason.contains("TimedOut")
    }
}

fn parse(xml: &str) -> Result<Document<'_>, String> {
    Document::parse(xml).map_err(|err| format!("malformed WS-Management response: {err}"))
}

fn descendant<'a, 'input>(doc: &'a Document<'input>, local: &str) -> Option<Node<'a, 'input>> {
    doc.descendants().find(|node| node.tag_name().name() == local)
}

fn element_text(doc: &Document<'_>, local: &str) -> Option<String> {
    descendant(doc, local)
        .and_then(|node| node.text())
        .map(|text| text.trim().to_owned())
        .filter(|text| !text.is_empty())
}

/// Extracts the shell identifier from a `Create` response.
pub(super) fn parse_shell_id(xml: &str) -> Result<String, String> {
    let doc = parse(xml)?;
    element_text(&doc, "ShellId")
        .or_else(|| {
            doc.descendants()
                .find(|node| {
                    node.tag_name().name() == "Selector" && node.attribute("Name") == Some("ShellId")
                })
                .and_then(|node| node.text())
                .map(|text| text.trim().to_owned())
        })
        .ok_or_else(|| String::from("response carries no ShellId"))
}

/// Extracts the command identifier from a `Command` response.
pub(super) fn parse_command_id(xml: &str) -> Result<String, String> {
    let doc = parse(xml)?;
    element_text(&doc, "CommandId").ok_or_else(|| String::from("response carries no CommandId"))
}

/// Decodes the streams and state from a `Receive` response.
pub(super) fn parse_receive(xml: &str) -> Result<ReceiveChunk, String> {
    let doc = parse(xml)?;
    let mut chunk = ReceiveChunk::default();
    for stream in doc
        .descendants()
        .filter(|node| node.tag_name().name() == "Stream")
    {
        let Some(encoded) = stream.text().map(str::trim).filter(|t| !t.is_empty()) else {
            continue;
        };
        let bytes = STANDARD
            .decode(encoded)
            .map_err(|err| format!("stream is not base64: {err}"))?;
        match stream.attribute("Name") {
            Some("stdout") => chunk.stdout.extend_from_slice(&bytes),
            Some("stderr") => chunk.stderr.extend_from_slice(&bytes),
            _ => {}
        }
    }
    if let Some(state) = descendant(&doc, "CommandState") {
        chunk.done = state
            .attribute("State")
            .is_some_and(|value| value.ends_with(STATE_DONE_SUFFIX));
        chunk.exit_code = state
            .children()
            .find(|node| node.tag_name().name() == "ExitCode")
            .and_then(|node| node.text())
            .and_then(|text| text.trim().parse().ok());
    }
    Ok(chunk)
}

/// Reads a SOAP fault, if the document is one.
pub(super) fn parse_fault(xml: &str) -> Option<Fault> {
    let doc = Document::parse(xml).ok()?;
    let fault = descendant(&doc, "Fault")?;
    let code = fault
        .descendants()
        .find(|node| node.tag_name().name() == "WSManFault")
        .and_then(|node| node.attribute("Code"))
        .map(str::to_owned);
    let subcode = fault
        .descendants()
        .filter(|node| node.tag_name().name() == "Value")
        .filter_map(|node| node.text())
        .last()
        .unwrap_or_default();
    let message = fault
        .descendants()
        .find(|node| matches!(node.tag_name().name(), "Message" | "Text"))
        .and_then(|node| node.text())
        .map(str::trim)
        .unwrap_or_default();
    Some(Fault {
        code,
        reason: format!("{subcode} {message}").trim().to_owned(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const ENDPOINT: &str = "http://hv01:5985/wsman";

    #[test]
    fn command_envelope_escapes_the_command_line() {
        let xml = command(ENDPOINT, "SHELL-1", "echo a<b & 'c'", Duration::from_secs(60));
        assert!(xml.contains("echo a&lt;b &amp; &apos;c&apos;"));
        assert!(xml.contains(r#"<w:Selector Name="ShellId">SHELL-1</w:Selector>"#));
        assert!(xml.contains("<w:OperationTimeout>PT60S</w:OperationTimeout>"));
        Document::parse(&xml).expect("envelope should be well-formed XML");
    }

    #[test]
    fn create_envelope_is_well_formed() {
        let xml = create_shell(ENDPOINT, Duration::from_millis(10));
        assert!(xml.contains(ACTION_CREATE));
        assert!(xml.contains("PT1S"));
        Document::parse(&xml).expect("envelope should be well-formed XML");
    }

    #[test]
    fn parses_shell_id_from_body_or_selector() {
        let body = r#"<s:Envelope xmlns:s="http://www.w3.org/2003/05/soap-envelope" xmlns:rsp="http://schemas.microsoft.com/wbem/wsman/1/windows/shell"><s:Body><rsp:Shell><rsp:ShellId>ABC</rsp:ShellId></rsp:Shell></s:Body></s:Envelope>"#;
        assert_eq!(parse_shell_id(body).expect("shell id"), "ABC");
        let selector = r#"<s:Envelope xmlns:s="http://www.w3.org/2003/05/soap-envelope" xmlns:w="http://schemas.dmtf.org/wbem/wsman/1/wsman.xsd"><s:Header><w:SelectorSet><w:Selector Name="ShellId">DEF</w:Selector></w:SelectorSet></s:Header><s:Body/></s:Envelope>"#;
        assert_eq!(parse_shell_id(selector).expect("shell id"), "DEF");
    }

    #[test]
    fn parses_streams_and_exit_code() {
        let xml = format!(
            concat!(
                r#"<s:Envelope xmlns:s="http://www.w3.org/2003/05/soap-envelope" xmlns:rsp="http://schemas.microsoft.com/wbem/wsman/1/windows/shell"><s:Body><rsp:ReceiveResponse>"#,
                r#"<rsp:Stream Name="stdout" CommandId="C">{out}</rsp:Stream>"#,
                r#"<rsp:Stream Name="stderr" CommandId="C">{err}</rsp:Stream>"#,
                r#"<rsp:Stream Name="stdout" CommandId="C" End="true"></rsp:Stream>"#,
                r#"<rsp:CommandState CommandId="C" State="http://schemas.microsoft.com/wbem/wsman/1/windows/shell/CommandState/Done"><rsp:ExitCode>3</rsp:ExitCode></rsp:CommandState>"#,
                "</rsp:ReceiveResponse></s:Body></s:Envelope>"
            ),
            out = STANDARD.encode("{\"Path\":\"x\"}"),
            err = STANDARD.encode("warning"),
        );
        let chunk = parse_receive(&xml).expect("receive should parse");
        assert_eq!(chunk.stdout, b"{\"Path\":\"x\"}");
        assert_eq!(chunk.stderr, b"warning");
        assert!(chunk.done);
        assert_eq!(chunk.exit_code, Some(3));
    }

    #[test]
    fn recognises_operation_timeout_fault() {
        let xml = concat!(
            r#"<s:Envelope xmlns:s="http://www.w3.org/2003/05/soap-envelope" xmlns:w="http://schemas.dmtf.org/wbem/wsman/1/wsman.xsd"><s:Body><s:Fault>"#,
            "<s:Code><s:Value>s:Receiver</s:Value><s:Subcode><s:Value>w:TimedOut</s:Value></s:Subcode></s:Code>",
            r#"<s:Reason><s:Text xml:lang="">The operation timed out.</s:Text></s:Reason>"#,
            r#"<s:Detail><f:WSManFault xmlns:f="http://schemas.microsoft.com/wbem/wsman/1/wsmanfault" Code="2150858793" Machine="hv01"><f:Message>timed out</f:Message></f:WSManFault></s:Detail>"#,
            "</s:Fault></s:Body></s:Envelope>"
        );
        let fault = parse_fault(xml).expect("fault should parse");
        assert!(fault.is_operation_timeout());
        assert_eq!(fault.code.as_deref(), Some(OPERATION_TIMEOUT_CODE));
    }

    #[test]
    fn non_fault_documents_are_ignored() {
        assert!(parse_fault("<a/>").is_none());
        assert!(parse_fault("not xml").is_none());
    }
}
