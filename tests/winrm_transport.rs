//! WinRM transport behaviour against a scripted WS-Management listener.

use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use hyperv_remote::{
    AuthMethod, Credentials, ErrorKind, HypervError, Password, ScriptInvocation, Session,
    StagingPath, Transport, WinRmTransport,
};
use wiremock::matchers::{body_string_contains, header, header_exists, method, path};
use wiremock::{Mock, MockServer, Request, ResponseTemplate};

const SHELL_ID: &str = "11111111-2222-3333-4444-555555555555";
const COMMAND_ID: &str = "66666666-7777-8888-9999-000000000000";

const ACTION_CREATE: &str = "transfer/Create</a:Action>";
const ACTION_COMMAND: &str = "shell/Command</a:Action>";
const ACTION_RECEIVE: &str = "shell/Receive</a:Action>";
const ACTION_SIGNAL: &str = "shell/Signal</a:Action>";
const ACTION_DELETE: &str = "transfer/Delete</a:Action>";

fn envelope(body: &str) -> String {
    format!(
        concat!(
            r#"<s:Envelope xmlns:s="http://www.w3.org/2003/05/soap-envelope""#,
            r#" xmlns:rsp="http://schemas.microsoft.com/wbem/wsman/1/windows/shell">"#,
            "<s:Body>{}</s:Body></s:Envelope>"
        ),
        body
    )
}

fn soap(body: &str) -> ResponseTemplate {
    ResponseTemplate::new(200)
        .insert_header("content-type", "application/soap+xml;charset=UTF-8")
        .set_body_string(envelope(body))
}

fn receive_done(stdout: &str, stderr: &str, exit_code: i64) -> ResponseTemplate {
    soap(&format!(
        concat!(
            "<rsp:ReceiveResponse>",
            r#"<rsp:Stream Name="stdout" CommandId="{id}">{out}</rsp:Stream>"#,
            r#"<rsp:Stream Name="stderr" CommandId="{id}">{err}</rsp:Stream>"#,
            r#"<rsp:CommandState CommandId="{id}" State="http://schemas.microsoft.com/wbem/wsman/1/windows/shell/CommandState/Done">"#,
            "<rsp:ExitCode>{code}</rsp:ExitCode></rsp:CommandState>",
            "</rsp:ReceiveResponse>"
        ),
        id = COMMAND_ID,
        out = STANDARD.encode(stdout),
        err = STANDARD.encode(stderr),
        code = exit_code,
    ))
}

fn operation_timeout_fault() -> ResponseTemplate {
    ResponseTemplate::new(500).set_body_string(concat!(
        r#"<s:Envelope xmlns:s="http://www.w3.org/2003/05/soap-envelope"><s:Body><s:Fault>"#,
        "<s:Code><s:Value>s:Receiver</s:Value><s:Subcode><s:Value>w:TimedOut</s:Value></s:Subcode></s:Code>",
        r#"<s:Reason><s:Text xml:lang="">The WS-Management service cannot complete the operation within the time specified in OperationTimeout.</s:Text></s:Reason>"#,
        r#"<s:Detail><f:WSManFault xmlns:f="http://schemas.microsoft.com/wbem/wsman/1/wsmanfault" Code="2150858793" Machine="hv01"><f:Message>timed out</f:Message></f:WSManFault></s:Detail>"#,
        "</s:Fault></s:Body></s:Envelope>"
    ))
}

async fn mount_action(server: &MockServer, action: &str, response: ResponseTemplate) {
    Mock::given(method("POST"))
        .and(path("/wsman"))
        .and(body_string_contains(action))
        .respond_with(response)
        .mount(server)
        .await;
}

/// Mounts create, command, signal, and delete handlers; receive is left to
/// each test.
async fn mount_shell(server: &MockServer) {
    mount_action(
        server,
        ACTION_CREATE,
        soap(&format!("<rsp:Shell><rsp:ShellId>{SHELL_ID}</rsp:ShellId></rsp:Shell>")),
    )
    .await;
    mount_action(
        server,
        ACTION_COMMAND,
        soap(&format!(
            "<rsp:CommandResponse><rsp:CommandId>{COMMAND_ID}</rsp:CommandId></rsp:CommandResponse>"
        )),
    )
    .await;
    mount_action(server, ACTION_SIGNAL, soap("<rsp:SignalResponse/>")).await;
    mount_action(server, ACTION_DELETE, soap("")).await;
}

fn session(server: &MockServer, auth: AuthMethod) -> Session {
    let address = server.address();
    Session::builder(
        address.ip().to_string(),
        Credentials::new("LAB\\operator", Password::new("s3cret")),
    )
    .port(address.port())
    .auth(auth)
    .staging(StagingPath::new("C:/Stage/run_%RAND%.ps1").expect("pattern has placeholder"))
    .operation_timeout(Duration::from_secs(10))
    .build()
    .expect("session should build")
}

fn transport(server: &MockServer, auth: AuthMethod) -> WinRmTransport {
    WinRmTransport::new(session(server, auth)).expect("transport should build")
}

fn invocation(body: impl Into<String>) -> ScriptInvocation {
    ScriptInvocation::new("get_vhd", body, Duration::from_secs(10), true)
}

/// Decodes the NTLM message carried by a request's `Authorization` header.
fn ntlm_message(request: &Request) -> Option<Vec<u8>> {
    let value = request.headers.get("authorization")?.to_str().ok()?;
    let token = value.strip_prefix("Negotiate ")?;
    STANDARD.decode(token).ok()
}

fn ntlm_message_type(request: &Request) -> Option<u8> {
    ntlm_message(request)
        .filter(|message| message.starts_with(b"NTLMSSP\0"))
        .and_then(|message| message.get(8).copied())
}

/// Type 2 message with an empty target name and a bare target info list.
#[expect(
    clippy::little_endian_bytes,
    reason = "NTLM messages are little-endian on the wire"
)]
fn challenge_message() -> Vec<u8> {
    let mut message = Vec::with_capacity(52);
    message.extend_from_slice(b"NTLMSSP\0");
    message.extend_from_slice(&2_u32.to_le_bytes());
    message.extend_from_slice(&[0, 0, 0, 0]);
    message.extend_from_slice(&48_u32.to_le_bytes());
    message.extend_from_slice(&0x628a_8215_u32.to_le_bytes());
    message.extend_from_slice(&[0x01, 0x23, 0x45, 0x67, 0x89, 0xab, 0xcd, 0xef]);
    message.extend_from_slice(&[0; 8]);
    message.extend_from_slice(&[4, 0, 4, 0]);
    message.extend_from_slice(&48_u32.to_le_bytes());
    message.extend_from_slice(&[0; 4]);
    message
}

async fn requests_with(server: &MockServer, action: &str) -> Vec<Request> {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .into_iter()
        .filter(|request| String::from_utf8_lossy(&request.body).contains(action))
        .collect()
}

#[tokio::test]
async fn basic_auth_runs_the_full_shell_lifecycle() {
    let server = MockServer::start().await;
    let token = STANDARD.encode("LAB\\operator:s3cret");
    Mock::given(method("POST"))
        .and(header("authorization", format!("Basic {token}").as_str()))
        .and(body_string_contains(ACTION_RECEIVE))
        .respond_with(receive_done(r#"{"Path":"C:\\VMs\\a.vhdx"}"#, "", 0))
        .mount(&server)
        .await;
    mount_shell(&server).await;

    let result = transport(&server, AuthMethod::Basic)
        .execute(&invocation("Get-VHD -Path 'C:\\VMs\\a.vhdx' | ConvertTo-Json"))
        .await
        .expect("script should run");

    assert_eq!(result.exit_code, Some(0));
    assert_eq!(result.stdout, r#"{"Path":"C:\\VMs\\a.vhdx"}"#);
    assert!(result.is_success());
    for action in [ACTION_CREATE, ACTION_COMMAND, ACTION_SIGNAL, ACTION_DELETE] {
        assert_eq!(requests_with(&server, action).await.len(), 1, "{action}");
    }
    let commands = requests_with(&server, ACTION_COMMAND).await;
    let command = commands
        .first()
        .map(|request| String::from_utf8_lossy(&request.body).into_owned())
        .expect("one command request");
    assert!(command.contains("-EncodedCommand"));
    assert!(command.contains(&format!(r#"<w:Selector Name="ShellId">{SHELL_ID}</w:Selector>"#)));
}

#[tokio::test]
async fn failing_script_reports_exit_code_and_clean_stderr() {
    let server = MockServer::start().await;
    let clixml = concat!(
        "#< CLIXML\r\n",
        r#"<Objs Version="1.1.0.1" xmlns="http://schemas.microsoft.com/powershell/2004/04">"#,
        r#"<S S="Error">Get-VM : no such machine_x000D__x000A_</S></Objs>"#
    );
    mount_action(&server, ACTION_RECEIVE, receive_done("", clixml, 1)).await;
    mount_shell(&server).await;

    let result = transport(&server, AuthMethod::Basic)
        .execute(&invocation("Get-VM -Name 'ghost'"))
        .await
        .expect("exchange should complete");

    assert_eq!(result.exit_code, Some(1));
    assert_eq!(result.stderr, "Get-VM : no such machine");
    assert!(!result.is_success());
}

#[tokio::test]
async fn operation_timeout_faults_keep_polling() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(body_string_contains(ACTION_RECEIVE))
        .respond_with(operation_timeout_fault())
        .up_to_n_times(2)
        .with_priority(1)
        .mount(&server)
        .await;
    mount_action(&server, ACTION_RECEIVE, receive_done("done", "", 0)).await;
    mount_shell(&server).await;

    let result = transport(&server, AuthMethod::Basic)
        .execute(&invocation("Start-Sleep -Seconds 120; 'done'"))
        .await
        .expect("script should eventually finish");

    assert_eq!(result.stdout, "done");
    assert_eq!(requests_with(&server, ACTION_RECEIVE).await.len(), 3);
}

#[tokio::test]
async fn oversized_scripts_are_staged_and_cleaned_up() {
    let server = MockServer::start().await;
    mount_action(&server, ACTION_RECEIVE, receive_done("staged", "", 0)).await;
    mount_shell(&server).await;
    let body = "Write-Output 'padding the script beyond the inline limit'\n".repeat(120);

    let result = transport(&server, AuthMethod::Basic)
        .execute(&invocation(body))
        .await
        .expect("staged script should run");

    assert_eq!(result.stdout, "staged");
    let commands: Vec<String> = requests_with(&server, ACTION_COMMAND)
        .await
        .iter()
        .map(|request| String::from_utf8_lossy(&request.body).into_owned())
        .collect();
    assert!(commands.len() >= 4, "upload, materialise, run, cleanup");
    assert!(commands.iter().any(|c| c.contains(r".ps1.b64&quot;")));
    assert!(commands.iter().any(|c| c.contains(r"-File &quot;C:\Stage\run_")));
    let cleanup = commands.last().expect("cleanup command");
    assert!(cleanup.contains("del /F /Q"));
    assert_eq!(requests_with(&server, ACTION_CREATE).await.len(), 1);
}

#[tokio::test]
async fn rejected_credentials_are_a_transport_failure() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;

    let err = transport(&server, AuthMethod::Basic)
        .execute(&invocation("Get-VM"))
        .await
        .expect_err("401 should fail");

    assert_eq!(err.kind(), ErrorKind::TransportFailure);
    assert!(err.is_retryable());
    assert!(!err.to_string().contains("s3cret"));
}

#[tokio::test]
async fn ntlm_starts_with_a_negotiate_message() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(header_exists("authorization"))
        .respond_with(ResponseTemplate::new(401).insert_header("www-authenticate", "Negotiate"))
        .mount(&server)
        .await;

    let err = transport(&server, AuthMethod::Ntlm)
        .execute(&invocation("Get-VM"))
        .await
        .expect_err("listener never completes the handshake");

    assert_eq!(err.kind(), ErrorKind::TransportFailure);
    let requests = server.received_requests().await.unwrap_or_default();
    let first = requests.first().expect("negotiate request");
    let value = first
        .headers
        .get("authorization")
        .and_then(|value| value.to_str().ok())
        .expect("authorization header");
    let token = value.strip_prefix("Negotiate ").expect("negotiate scheme");
    let message = STANDARD.decode(token).expect("base64 token");
    assert!(message.starts_with(b"NTLMSSP\0"));
    assert_eq!(message.get(8), Some(&1));
}

#[tokio::test]
async fn slow_listener_hits_the_deadline() {
    let server = MockServer::start().await;
    mount_action(
        &server,
        ACTION_RECEIVE,
        receive_done("late", "", 0).set_delay(Duration::from_secs(5)),
    )
    .await;
    mount_shell(&server).await;

    let err = transport(&server, AuthMethod::Basic)
        .execute(&ScriptInvocation::new(
            "get_vhd",
            "Get-VM",
            Duration::from_millis(200),
            true,
        ))
        .await
        .expect_err("deadline should expire");

    assert_eq!(err.kind(), ErrorKind::Timeout);
}

#[tokio::test]
async fn ntlm_handshake_authenticates_the_first_envelope_only() {
    let server = MockServer::start().await;
    let challenge = format!("Negotiate {}", STANDARD.encode(challenge_message()));
    Mock::given(method("POST"))
        .and(|request: &Request| ntlm_message_type(request) == Some(1))
        .respond_with(ResponseTemplate::new(401).insert_header("www-authenticate", challenge.as_str()))
        .with_priority(1)
        .mount(&server)
        .await;
    mount_action(&server, ACTION_RECEIVE, receive_done("{}", "", 0)).await;
    mount_shell(&server).await;

    let result = transport(&server, AuthMethod::Ntlm)
        .execute(&invocation("Get-VM | ConvertTo-Json"))
        .await
        .expect("authenticated script should run");
    assert_eq!(result.exit_code, Some(0));
    assert_eq!(result.stdout, "{}");

    let requests = server.received_requests().await.unwrap_or_default();
    let (negotiate, rest) = requests.split_first().expect("negotiate request");
    assert_eq!(ntlm_message_type(negotiate), Some(1));
    assert!(negotiate.body.is_empty());

    let (authenticate, envelopes) = rest.split_first().expect("authenticate request");
    assert_eq!(ntlm_message_type(authenticate), Some(3));
    assert!(String::from_utf8_lossy(&authenticate.body).contains(ACTION_CREATE));

    assert!(envelopes.len() >= 4, "command, receive, signal, delete");
    assert!(
        envelopes
            .iter()
            .all(|request| !request.headers.contains_key("authorization")),
        "later envelopes reuse the authenticated connection"
    );
}

#[tokio::test]
async fn unchallenged_negotiate_resends_the_envelope() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(|request: &Request| ntlm_message_type(request) == Some(1))
        .respond_with(ResponseTemplate::new(200))
        .with_priority(1)
        .mount(&server)
        .await;
    mount_action(&server, ACTION_RECEIVE, receive_done("open", "", 0)).await;
    mount_shell(&server).await;

    let result = transport(&server, AuthMethod::Ntlm)
        .execute(&invocation("'open'"))
        .await
        .expect("listener without authentication should still run the script");

    assert_eq!(result.stdout, "open");
    let creates = requests_with(&server, ACTION_CREATE).await;
    assert_eq!(creates.len(), 1);
    assert!(creates.iter().all(|request| ntlm_message_type(request).is_none()));
}

#[tokio::test]
async fn failed_staging_is_a_remote_script_failure() {
    let server = MockServer::start().await;
    mount_action(
        &server,
        ACTION_RECEIVE,
        receive_done("", "The system cannot find the path specified.", 1),
    )
    .await;
    mount_shell(&server).await;
    let body = "Write-Output 'padding the script beyond the inline limit'\n".repeat(120);

    let err = transport(&server, AuthMethod::Basic)
        .execute(&invocation(body))
        .await
        .expect_err("upload step should fail");

    assert_eq!(err.kind(), ErrorKind::RemoteScriptFailure);
    assert!(!err.is_retryable());
    let HypervError::RemoteScript { ref script, exit_code, ref stderr, .. } = err else {
        panic!("expected RemoteScript error, got {err}");
    };
    assert_eq!(script, "get_vhd");
    assert_eq!(exit_code, Some(1));
    assert!(stderr.contains(r"staging C:\Stage\run_"), "stderr: {stderr}");
    assert!(stderr.contains("The system cannot find the path specified."));

    let commands = requests_with(&server, ACTION_COMMAND).await;
    let cleanup = commands.last().expect("cleanup command");
    assert!(String::from_utf8_lossy(&cleanup.body).contains("del /F /Q"));
}
