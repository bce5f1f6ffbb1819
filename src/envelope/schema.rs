//! Request schemas
//!
//! The fingerprint of every message kind the platform publishes: required
//! fields and the event category/name pair stamped into the default headers.

/// The known request and reply schemas
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    /// Authentication request for an inbound endpoint
    AuthReq,
    /// Routing request for an inbound call
    RouteReq,
    /// Registration lookup for a known endpoint
    RegQuery,
    /// Media fetch request
    MediaReq,
    /// Media fetch response carrying the stream location
    MediaResp,
    /// Media fetch failure reply
    MediaError,
}

impl RequestKind {
    /// Fields that must be present for the payload to be publishable
    pub fn required_fields(self) -> &'static [&'static str] {
        match self {
            RequestKind::AuthReq => &["Msg-ID", "To"],
            RequestKind::RouteReq => &["Msg-ID", "To", "From", "Call-ID"],
            RequestKind::RegQuery => &["Msg-ID", "Username", "Realm"],
            RequestKind::MediaReq => &["Media-Name", "Server-ID"],
            RequestKind::MediaResp => &["Media-Name", "Stream-URL"],
            RequestKind::MediaError => &["Media-Name", "Error-Code"],
        }
    }

    /// The (Event-Category, Event-Name) pair for the default headers
    pub fn event(self) -> (&'static str, &'static str) {
        match self {
            RequestKind::AuthReq => ("directory", "auth_req"),
            RequestKind::RouteReq => ("dialplan", "route_req"),
            RequestKind::RegQuery => ("directory", "reg_query"),
            RequestKind::MediaReq => ("media", "media_req"),
            RequestKind::MediaResp => ("media", "media_resp"),
            RequestKind::MediaError => ("media", "media_error"),
        }
    }
}

impl std::fmt::Display for RequestKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (_, name) = self.event();
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_name_matches_display() {
        for kind in [
            RequestKind::AuthReq,
            RequestKind::RouteReq,
            RequestKind::RegQuery,
            RequestKind::MediaReq,
            RequestKind::MediaResp,
            RequestKind::MediaError,
        ] {
            assert_eq!(kind.to_string(), kind.event().1);
        }
    }

    #[test]
    fn test_required_fields_nonempty() {
        assert!(RequestKind::AuthReq.required_fields().contains(&"Msg-ID"));
        assert!(RequestKind::MediaError.required_fields().contains(&"Error-Code"));
    }
}
