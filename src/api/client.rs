use color_eyre::{eyre::eyre, Result};
use reqwest::header::{HeaderValue, CONTENT_TYPE};
use std::error::Error as _;
use std::io;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, warn};
use url::Url;

use super::transport::{Network, Outcome, TransportErrorKind, WireRequest};
use crate::event::Event;

/// Header carrying the request id; the server echoes it back.
const ID_HEADER: &str = "Id";

/// Upper bound for a single HTTP exchange. The transport expires requests much
/// earlier, this only keeps abandoned tasks from lingering.
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// HTTP backend for the transport.
///
/// Each request runs on its own tokio task; the result is posted back to the
/// engine as an [`Event::Response`].
#[derive(Clone)]
pub struct HttpNetwork {
  client: reqwest::Client,
  base: Url,
  events: UnboundedSender<Event>,
}

impl HttpNetwork {
  pub fn new(server_url: &str, events: UnboundedSender<Event>) -> Result<Self> {
    let mut base =
      Url::parse(server_url).map_err(|e| eyre!("Invalid server url {}: {}", server_url, e))?;
    // Request paths are joined relative to the base, so it must end in '/'
    if !base.path().ends_with('/') {
      let path = format!("{}/", base.path());
      base.set_path(&path);
    }

    let client = reqwest::Client::builder()
      .timeout(HTTP_TIMEOUT)
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      client,
      base,
      events,
    })
  }

  fn build(&self, request: &WireRequest) -> Result<reqwest::RequestBuilder> {
    let url = self
      .base
      .join(request.path.trim_start_matches('/'))
      .map_err(|e| eyre!("Invalid request path {}: {}", request.path, e))?;

    let builder = match &request.body {
      None => self.client.get(url),
      Some(body) => {
        let bytes = serde_json::to_vec(body)
          .map_err(|e| eyre!("Failed to serialize request {}: {}", request.id, e))?;
        self
          .client
          .post(url)
          .header(
            CONTENT_TYPE,
            HeaderValue::from_static("application/json; charset=utf-8"),
          )
          .body(bytes)
      }
    };

    Ok(builder.header(ID_HEADER, request.id.get().to_string()))
  }
}

impl Network for HttpNetwork {
  fn dispatch(&self, request: WireRequest) {
    let id = request.id;
    let events = self.events.clone();

    let builder = match self.build(&request) {
      Ok(builder) => builder,
      Err(e) => {
        warn!(request_id = %id, "{}", e);
        let _ = events.send(Event::Response {
          id,
          outcome: Outcome::TransportError(TransportErrorKind::Unknown),
        });
        return;
      }
    };

    tokio::spawn(async move {
      let outcome = match builder.send().await {
        Ok(response) => {
          let status = response.status().as_u16();
          match response.bytes().await {
            Ok(body) => Outcome::Ok {
              status,
              body: body.to_vec(),
            },
            Err(e) => {
              debug!(request_id = %id, "failed to read response body: {}", e);
              Outcome::TransportError(classify(&e))
            }
          }
        }
        Err(e) => {
          debug!(request_id = %id, "request failed: {}", e);
          Outcome::TransportError(classify(&e))
        }
      };

      // The engine is gone when the channel is closed, nothing to report to
      let _ = events.send(Event::Response { id, outcome });
    });
  }
}

/// Map a reqwest failure onto the transport error kinds.
fn classify(err: &reqwest::Error) -> TransportErrorKind {
  let mut source = err.source();
  while let Some(cause) = source {
    if let Some(io_err) = cause.downcast_ref::<io::Error>() {
      if io_err.kind() == io::ErrorKind::ConnectionRefused {
        return TransportErrorKind::ConnectionRefused;
      }
    }
    let text = cause.to_string();
    if text.contains("dns error") || text.contains("failed to lookup address") {
      return TransportErrorKind::HostNotFound;
    }
    source = cause.source();
  }
  TransportErrorKind::Unknown
}
