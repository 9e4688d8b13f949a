//! HTTP channel carrying SOAP envelopes to the WinRM listener.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderValue, WWW_AUTHENTICATE};
use reqwest::{Certificate, Client, RequestBuilder, Response, StatusCode};
use tracing::{debug, warn};

use super::ntlm;
use super::soap::{self, Fault};
use crate::error::HypervError;
use crate::session::{AuthMethod, Session};

const SOAP_CONTENT_TYPE: &str = "application/soap+xml;charset=UTF-8";

/// Extra time granted to an HTTP request beyond the WS-Management timeout.
const REQUEST_GRACE: Duration = Duration::from_secs(30);

/// Reply to one SOAP request.
#[derive(Debug)]
pub(super) enum SoapReply {
    /// Successful response body.
    Body(String),
    /// The listener answered with a SOAP fault.
    Fault(Fault),
}

/// Whether a request may be resent after a connection-level failure.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(super) enum Resend {
    /// One reconnect attempt is allowed.
    Once,
    /// The request is not idempotent; fail immediately.
    Never,
}

/// Builds the `reqwest` client for `session`.
pub(super) fn build_client(session: &Session) -> Result<Client, HypervError> {
    let security = session.security();
    let mut builder = Client::builder()
        .danger_accept_invalid_certs(security.insecure)
        .pool_idle_timeout(Duration::from_secs(60));
    if let Some(pem) = &security.ca_certificate {
        let cert = Certificate::from_pem(pem)
            .map_err(|err| HypervError::transport(session.host(), format!("invalid CA certificate: {err}")))?;
        builder = builder.add_root_certificate(cert);
    }
    if let (Some(name), Ok(addr)) = (
        security.tls_server_name.as_deref(),
        session.host().parse::<IpAddr>(),
    ) {
        builder = builder.resolve(name, SocketAddr::new(addr, session.port()));
    }
    builder
        .build()
        .map_err(|err| HypervError::transport(session.host(), err.to_string()))
}

/// Endpoint URL, honouring `tls_server_name` for address hosts.
pub(super) fn endpoint_for(session: &Session) -> String {
    match session.security().tls_server_name.as_deref() {
        Some(name) if session.host().parse::<IpAddr>().is_ok() => {
            let scheme = if session.security().https { "https" } else { "http" };
            format!("{scheme}://{name}:{}/wsman", session.port())
        }
        _ => session.endpoint(),
    }
}

/// One authenticated conversation with the listener.
///
/// NTLM authenticates the TCP connection rather than the request, so an
/// NTLM channel owns a private client with a single pooled connection and
/// must be used sequentially.
pub(super) struct HttpChannel<'s> {
    session: &'s Session,
    client: Client,
    endpoint: String,
    ntlm_ready: bool,
}

impl<'s> HttpChannel<'s> {
    /// Opens a channel reusing `shared` for Basic auth.
    pub(super) fn open(session: &'s Session, shared: &Client) -> Result<Self, HypervError> {
        let client = match session.auth() {
            AuthMethod::Basic => shared.clone(),
            AuthMethod::Ntlm => build_client(session)?,
        };
        Ok(Self {
            session,
            client,
            endpoint: endpoint_for(session),
            ntlm_ready: false,
        })
    }

    /// Endpoint the envelopes address.
    pub(super) fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Transport error for this host with credentials scrubbed.
    pub(super) fn failure(&self, message: impl AsRef<str>) -> HypervError {
        HypervError::transport(
            self.session.host(),
            self.session.credentials().scrub(message.as_ref()),
        )
    }

    fn request(&self, body: String, timeout: Duration) -> RequestBuilder {
        self.client
            .post(&self.endpoint)
            .header(CONTENT_TYPE, SOAP_CONTENT_TYPE)
            .timeout(timeout.saturating_add(REQUEST_GRACE))
            .body(body)
    }

    /// Posts `envelope` and classifies the reply.
    pub(super) async fn post(
        &mut self,
        envelope: &str,
        timeout: Duration,
        resend: Resend,
    ) -> Result<SoapReply, HypervError> {
        let response = match self.send(envelope, timeout).await {
            Err(err) if resend == Resend::Once && is_stale_connection(&err) => {
                warn!(host = self.session.host(), error = %err, "reconnecting after connection failure");
                self.ntlm_ready = false;
                self.send(envelope, timeout).await
            }
            other => other,
        }
        .map_err(|err| self.failure(describe(&err)))?;
        self.interpret(response).await
    }

    async fn send(&mut self, envelope: &str, timeout: Duration) -> Result<Response, reqwest::Error> {
        match self.session.auth() {
            AuthMethod::Basic => {
                let credentials = self.session.credentials();
                self.request(envelope.to_owned(), timeout)
                    .basic_auth(credentials.user(), Some(credentials.password().expose()))
                    .send()
                    .await
            }
            AuthMethod::Ntlm => {
                if self.ntlm_ready {
                    let response = self.request(envelope.to_owned(), timeout).send().await?;
                    if response.status() != StatusCode::UNAUTHORIZED {
                        return Ok(response);
                    }
                    drain(response).await;
                    self.ntlm_ready = false;
                }
                self.ntlm_exchange(envelope, timeout).await
            }
        }
    }

    async fn ntlm_exchange(
        &mut self,
        envelope: &str,
        timeout: Duration,
    ) -> Result<Response, reqwest::Error> {
        let negotiate = format!("Negotiate {}", STANDARD.encode(ntlm::negotiate_message()));
        let offer = self
            .request(String::new(), timeout)
            .header(AUTHORIZATION, negotiate)
            .send()
            .await?;
        if offer.status() != StatusCode::UNAUTHORIZED {
            drain(offer).await;
            return self.request(envelope.to_owned(), timeout).send().await;
        }
        let Some((scheme, token)) = challenge_token(offer.headers().get_all(WWW_AUTHENTICATE))
            .map(|(scheme, token)| (scheme, token.to_owned()))
        else {
            return Ok(offer);
        };
        drain(offer).await;

        let credentials = self.session.credentials();
        let (domain, account) = credentials.domain_and_account();
        let message = STANDARD
            .decode(token)
            .map_err(|err| err.to_string())
            .and_then(|bytes| ntlm::parse_challenge(&bytes))
            .and_then(|challenge| {
                ntlm::authenticate_message(account, domain, credentials.password().expose(), &challenge)
            });
        let authenticate = match message {
            Ok(bytes) => format!("{scheme} {}", STANDARD.encode(bytes)),
            Err(reason) => {
                warn!(host = self.session.host(), %reason, "unusable NTLM challenge");
                return self.request(envelope.to_owned(), timeout).send().await;
            }
        };
        let response = self
            .request(envelope.to_owned(), timeout)
            .header(AUTHORIZATION, authenticate)
            .send()
            .await?;
        self.ntlm_ready = response.status() != StatusCode::UNAUTHORIZED;
        debug!(host = self.session.host(), authenticated = self.ntlm_ready, "NTLM handshake finished");
        Ok(response)
    }

    async fn interpret(&self, response: Response) -> Result<SoapReply, HypervError> {
        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            return Err(self.failure(format!(
                "authentication rejected for user {}",
                self.session.credentials().user()
            )));
        }
        let body = response
            .text()
            .await
            .map_err(|err| self.failure(describe(&err)))?;
        if status.is_success() {
            return Ok(SoapReply::Body(body));
        }
        soap::parse_fault(&body).map_or_else(
            || Err(self.failure(format!("HTTP {status}: {}", body.trim()))),
            |fault| Ok(SoapReply::Fault(fault)),
        )
    }
}

fn challenge_token<'h>(
    values: reqwest::header::GetAll<'h, HeaderValue>,
) -> Option<(&'static str, &'h str)> {
    values
        .into_iter()
        .filter_map(|value| value.to_str().ok())
        .find_map(|value| {
            value
                .strip_prefix("Negotiate ")
                .map(|token| ("Negotiate", token.trim()))
                .or_else(|| value.strip_prefix("NTLM ").map(|token| ("NTLM", token.trim())))
        })
}

async fn drain(response: Response) {
    if let Err(err) = response.bytes().await {
        debug!(error = %err, "discarding unreadable response body");
    }
}

fn is_stale_connection(err: &reqwest::Error) -> bool {
    !err.is_timeout() && (err.is_connect() || err.is_request())
}

fn describe(err: &reqwest::Error) -> String {
    if err.is_timeout() {
        format!("request timed out: {err}")
    } else if err.is_connect() {
        format!("connection failed: {err}")
    } else {
        err.to_string()
    }
}
