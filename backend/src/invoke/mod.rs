//! Invoking deployed agents
//!
//! Each target is reached over HTTP; Lambda and AgentCore calls are SigV4
//! signed. Responses are classified by `Content-Type` and then shaped into
//! what the caller asked for: JSON or a stream of SSE frames.

pub mod credentials;
pub mod response;
pub mod sigv4;
pub mod sse;
pub mod target;

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::Utc;
use http::header;
use reqwest::Client;
use tracing::{debug, error, info};

use crate::errors::BackendError;
use crate::invoke::credentials::CredentialSource;
use crate::invoke::response::{body_value, frames_from_bytes, is_event_stream, normalize};
use crate::invoke::sigv4::{sign, SigningParams};

pub use response::{FrameStream, InvokeResponse};
pub use sse::{FrameKind, SseFrame};
pub use target::{EndpointCall, InvokeTarget};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// A prompt for a deployed agent
#[derive(Debug, Clone)]
pub struct InvokeRequest {
    pub prompt: String,
    pub stream: bool,
    /// AgentCore runtime session
    pub session_id: Option<String>,
}

pub struct Invoker {
    client: Client,
    credentials: CredentialSource,
}

impl Invoker {
    pub fn new(credentials: CredentialSource, timeout: Duration) -> Result<Self, BackendError> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(timeout)
            .build()?;
        Ok(Self {
            client,
            credentials,
        })
    }

    pub async fn invoke(
        &self,
        target: &InvokeTarget,
        request: &InvokeRequest,
    ) -> Result<InvokeResponse, BackendError> {
        let call = target::endpoint_call(
            target,
            &request.prompt,
            request.stream,
            request.session_id.as_deref(),
        )?;
        let endpoint = call.url.to_string();
        info!("Invoking {} (stream: {})", endpoint, request.stream);
        let response = self.send(call).await?;
        normalize(&endpoint, response, request.stream).await
    }

    /// Send a prepared call and classify the response
    pub async fn send(&self, call: EndpointCall) -> Result<InvokeResponse, BackendError> {
        let endpoint = call.url.to_string();
        let body = serde_json::to_vec(&call.body)?;

        let mut headers: BTreeMap<String, String> = call.headers.into_iter().collect();
        headers.insert("content-type".to_string(), "application/json".to_string());
        if let Some((service, region)) = &call.signing {
            let credentials = self.credentials.resolve(region).await?;
            let signed = sign(
                "POST",
                &call.url,
                &headers,
                &body,
                &SigningParams {
                    credentials: &credentials,
                    region,
                    service,
                    time: Utc::now(),
                },
            )?;
            headers.extend(signed.headers);
        }

        let mut builder = self.client.post(call.url.clone()).body(body);
        for (name, value) in &headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        debug!("POST {}", endpoint);
        let response = builder.send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            error!("Invocation of {} failed: {} - {}", endpoint, status, body);
            return Err(BackendError::InvocationError {
                endpoint,
                status: status.as_u16(),
                body,
            });
        }

        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        if is_event_stream(content_type.as_deref()) {
            Ok(InvokeResponse::Stream(frames_from_bytes(response.bytes_stream())))
        } else {
            let text = response.text().await?;
            Ok(InvokeResponse::Json(body_value(&text)))
        }
    }
}
