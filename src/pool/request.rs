//! Outbound call kinds
//!
//! The four transactions the pool serves, distinguished only by their
//! envelope schema and publish routing.

use crate::broker::exchanges::MEDIA_REQ_KEY;
use crate::broker::PublishTarget;
use crate::envelope::RequestKind;

/// A request/reply transaction kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    /// Endpoint authentication request
    AuthReq,
    /// Call routing request
    RouteReq,
    /// Registration lookup
    RegQuery,
    /// Media fetch request
    MediaReq,
}

impl CallKind {
    /// The envelope schema this call is shaped against
    pub fn request_kind(self) -> RequestKind {
        match self {
            CallKind::AuthReq => RequestKind::AuthReq,
            CallKind::RouteReq => RequestKind::RouteReq,
            CallKind::RegQuery => RequestKind::RegQuery,
            CallKind::MediaReq => RequestKind::MediaReq,
        }
    }

    /// Where the shaped payload is published
    pub fn publish_target(self) -> PublishTarget {
        match self {
            CallKind::AuthReq => PublishTarget::callmgr("auth_req"),
            CallKind::RouteReq => PublishTarget::callmgr("route_req"),
            CallKind::RegQuery => PublishTarget::callmgr("reg_query"),
            CallKind::MediaReq => PublishTarget::callevt(MEDIA_REQ_KEY),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::exchanges;

    #[test]
    fn test_call_manager_routing() {
        for (kind, key) in [
            (CallKind::AuthReq, "auth_req"),
            (CallKind::RouteReq, "route_req"),
            (CallKind::RegQuery, "reg_query"),
        ] {
            let target = kind.publish_target();
            assert_eq!(target.exchange, exchanges::CALLMGR);
            assert_eq!(target.routing_key, key);
            assert_eq!(target.content_type, "application/json");
        }
    }

    #[test]
    fn test_media_routing() {
        let target = CallKind::MediaReq.publish_target();
        assert_eq!(target.exchange, exchanges::CALLEVT);
        assert_eq!(target.routing_key, MEDIA_REQ_KEY);
    }
}
