//! Error responses
//!
//! A failure raised before the response head is written replaces whatever
//! response was being prepared: the client gets a fresh plain-text reply
//! carrying only the CORS grants. Once the head has been sent the only
//! thing left to do is end the stream; hyper closes the connection when
//! the streamed body yields an error, so nothing is written here.

use hyper::ext::ReasonPhrase;
use hyper::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use hyper::Response;
use tracing::{error, warn};

use crate::error::ProksyError;
use crate::proxy::{full, ProxyBody};

/// Body text sent to the client for an error
pub fn error_message(err: &ProksyError) -> String {
    if err.is_proxy_error() {
        format!("Not found because of proxy error: {}", err)
    } else {
        err.to_string()
    }
}

/// Build the reply for a failed request
pub fn error_response(err: &ProksyError, cors: &HeaderMap) -> Response<ProxyBody> {
    let status = err.status_code();
    if status.is_server_error() {
        error!(status = status.as_u16(), error = %err, "Request failed");
    } else {
        warn!(status = status.as_u16(), error = %err, "Request rejected");
    }

    let mut response = Response::new(full(error_message(err)));
    *response.status_mut() = status;

    let headers = response.headers_mut();
    headers.extend(cors.clone());
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));

    if let Some(reason) = err.reason_phrase() {
        response
            .extensions_mut()
            .insert(ReasonPhrase::from_static(reason.as_bytes()));
    }

    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;
    use hyper::header::ACCESS_CONTROL_ALLOW_ORIGIN;
    use hyper::StatusCode;

    fn cors() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
        headers
    }

    async fn body_text(response: Response<ProxyBody>) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn validation_error_keeps_reason_phrase() {
        let response = error_response(&ProksyError::InvalidPort(70000), &cors());

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(response.headers()[ACCESS_CONTROL_ALLOW_ORIGIN], "*");
        assert_eq!(response.headers()[CONTENT_TYPE], "text/plain");
        assert_eq!(
            response
                .extensions()
                .get::<ReasonPhrase>()
                .map(|r| r.as_bytes()),
            Some(&b"Invalid port"[..])
        );
        assert_eq!(body_text(response).await, "Port number too large: 70000");
    }

    #[tokio::test]
    async fn proxy_error_is_reported_as_not_found() {
        let err = ProksyError::Http("connection reset".into());
        let response = error_response(&err, &cors());

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert!(response.extensions().get::<ReasonPhrase>().is_none());
        assert_eq!(
            body_text(response).await,
            "Not found because of proxy error: HTTP error: connection reset"
        );
    }

    #[tokio::test]
    async fn unresolvable_host_is_bad_gateway() {
        let err = ProksyError::HostUnresolvable {
            url: "http://nonexistent.invalid/".into(),
            reason: "failed to lookup address".into(),
        };
        let response = error_response(&err, &cors());

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(
            body_text(response).await,
            "Host for http://nonexistent.invalid/ cannot be found."
        );
    }
}
