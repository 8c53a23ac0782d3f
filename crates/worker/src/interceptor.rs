// hooks run around every routed request: before dispatch (may reject) and
// after the reply is built.

use std::time::Instant;

use mlworker_core::{ReplyEnvelope, RequestEnvelope};
use tracing::{debug, info, warn};

use crate::error::RequestError;

#[derive(Debug, Clone)]
pub struct RequestContext {
    pub id: String,
    pub action: String,
    // size of the encoded frame the request arrived in
    pub frame_size: usize,
    pub received_at: Instant,
}

impl RequestContext {
    pub fn new(envelope: &RequestEnvelope, frame_size: usize) -> Self {
        Self {
            id: envelope.id.clone(),
            action: envelope.action.clone(),
            frame_size,
            received_at: Instant::now(),
        }
    }
}

pub trait Interceptor: Send + Sync {
    fn name(&self) -> &'static str;

    fn before(&self, _ctx: &RequestContext, _envelope: &RequestEnvelope) -> Result<(), RequestError> {
        Ok(())
    }

    fn after(&self, _ctx: &RequestContext, _reply: &ReplyEnvelope) {}
}

// rejects frames above the receive limit
#[derive(Debug, Clone, Copy)]
pub struct PayloadLimit {
    pub max_bytes: usize,
}

impl Interceptor for PayloadLimit {
    fn name(&self) -> &'static str {
        "payload_limit"
    }

    fn before(&self, ctx: &RequestContext, _envelope: &RequestEnvelope) -> Result<(), RequestError> {
        if ctx.frame_size > self.max_bytes {
            return Err(RequestError::PayloadTooLarge {
                size: ctx.frame_size,
                limit: self.max_bytes,
            });
        }
        Ok(())
    }
}

// requires the shared token on every envelope
#[derive(Debug, Clone)]
pub struct TokenAuth {
    token: String,
}

impl TokenAuth {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

impl Interceptor for TokenAuth {
    fn name(&self) -> &'static str {
        "token_auth"
    }

    fn before(&self, _ctx: &RequestContext, envelope: &RequestEnvelope) -> Result<(), RequestError> {
        match envelope.token.as_deref() {
            Some(token) if token == self.token => Ok(()),
            Some(_) => Err(RequestError::Unauthorized("invalid request token".to_string())),
            None => Err(RequestError::Unauthorized("missing request token".to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RequestLogger;

impl Interceptor for RequestLogger {
    fn name(&self) -> &'static str {
        "request_logger"
    }

    fn before(&self, ctx: &RequestContext, _envelope: &RequestEnvelope) -> Result<(), RequestError> {
        debug!(bytes = ctx.frame_size, "request received");
        Ok(())
    }

    fn after(&self, ctx: &RequestContext, reply: &ReplyEnvelope) {
        let elapsed_ms = ctx.received_at.elapsed().as_millis() as u64;
        match &reply.error {
            None => info!(elapsed_ms, "request handled"),
            Some(error) => warn!(elapsed_ms, code = %error.code, error = %error.message, "request failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    fn envelope(token: Option<&str>) -> RequestEnvelope {
        RequestEnvelope {
            id: "1".into(),
            action: "echo".into(),
            param: Value::Null,
            token: token.map(str::to_string),
        }
    }

    #[test]
    fn payload_limit_rejects_large_frames() {
        let limit = PayloadLimit { max_bytes: 10 };
        let env = envelope(None);
        assert!(limit.before(&RequestContext::new(&env, 10), &env).is_ok());
        let err = limit.before(&RequestContext::new(&env, 11), &env).unwrap_err();
        assert_eq!(err.code(), "payload_too_large");
    }

    #[test]
    fn token_auth_checks_the_envelope() {
        let auth = TokenAuth::new("s3cret");
        let ok = envelope(Some("s3cret"));
        assert!(auth.before(&RequestContext::new(&ok, 0), &ok).is_ok());

        for env in [envelope(Some("nope")), envelope(None)] {
            let err = auth.before(&RequestContext::new(&env, 0), &env).unwrap_err();
            assert_eq!(err.error_type(), "auth_error");
        }
    }
}
