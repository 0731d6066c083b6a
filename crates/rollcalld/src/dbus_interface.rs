use crate::auth::OperatorPolicy;
use crate::engine::{EngineError, EngineHandle};
use chrono::NaiveDate;
use rollcall_core::types::single_probe;
use rollcall_core::{
    DetectedFace, Embedding, EnrollError, Identity, IdentityCandidate, ProbeError, PublicIdentity,
    RecordError, RecordedAttendance,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use zbus::message::Header;
use zbus::{fdo, interface};

#[derive(Debug, Deserialize)]
pub struct EnrollPayload {
    pub identity_id: String,
    pub display_name: String,
    pub contact_address: String,
    pub group_tag: String,
    /// Detector output for the enrollment image.
    pub faces: Vec<DetectedFace>,
}

#[derive(Debug, Deserialize)]
pub struct RecordPayload {
    pub session_tag: String,
    /// Defaults to today's UTC date.
    #[serde(default)]
    pub date: Option<NaiveDate>,
    pub faces: Vec<DetectedFace>,
}

/// Outcome of `Enroll`. Every expected rejection is a variant here.
#[derive(Debug, Serialize, PartialEq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum EnrollReply {
    Enrolled { identity: PublicIdentity },
    MissingField { field: String },
    NoFaceDetected,
    MultipleFacesDetected { count: usize },
    DuplicateFace { existing: PublicIdentity },
    DuplicateIdentity { identity_id: String },
    DuplicateContact { contact_address: String },
    NotReady { reason: String },
}

/// Outcome of `Record`.
#[derive(Debug, Serialize, PartialEq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RecordReply {
    Recorded {
        event_id: Uuid,
        identity: PublicIdentity,
        date: NaiveDate,
        session_tag: String,
    },
    AlreadyMarked { identity: PublicIdentity },
    /// `distance` is absent when the gallery is empty.
    NoMatch { distance: Option<f32> },
    MissingField { field: String },
    NoFaceDetected,
    MultipleFacesDetected { count: usize },
    NotReady { reason: String },
}

impl EnrollPayload {
    /// Field presence is checked before the faces are looked at.
    fn into_candidate(self) -> Result<IdentityCandidate, EnrollError> {
        let mut candidate = IdentityCandidate {
            identity_id: self.identity_id,
            display_name: self.display_name,
            contact_address: self.contact_address,
            group_tag: self.group_tag,
            embedding: Embedding::new(Vec::new()),
        };
        if let Some(field) = candidate.missing_field() {
            return Err(EnrollError::MissingField(field));
        }
        candidate.embedding = single_probe(self.faces)?;
        Ok(candidate)
    }
}

impl RecordPayload {
    fn into_probe(self) -> Result<(Embedding, String, Option<NaiveDate>), RecordError> {
        if self.session_tag.trim().is_empty() {
            return Err(RecordError::MissingField("session_tag"));
        }
        let probe = single_probe(self.faces)?;
        Ok((probe, self.session_tag, self.date))
    }
}

/// Map an enrollment result to a reply. Storage outages and malformed
/// extractor output stay `Err`.
pub fn enroll_reply(result: Result<Identity, EngineError>) -> Result<EnrollReply, EngineError> {
    let err = match result {
        Ok(identity) => {
            return Ok(EnrollReply::Enrolled {
                identity: identity.public(),
            })
        }
        Err(EngineError::Enroll(err)) => err,
        Err(other) => return Err(other),
    };
    Ok(match err {
        EnrollError::MissingField(field) => EnrollReply::MissingField {
            field: field.to_string(),
        },
        EnrollError::Probe(ProbeError::NoFaceDetected) => EnrollReply::NoFaceDetected,
        EnrollError::Probe(ProbeError::MultipleFacesDetected(count)) => {
            EnrollReply::MultipleFacesDetected { count }
        }
        EnrollError::DuplicateFace(existing) => EnrollReply::DuplicateFace { existing },
        EnrollError::DuplicateIdentity(identity_id) => EnrollReply::DuplicateIdentity { identity_id },
        EnrollError::DuplicateContact(contact_address) => {
            EnrollReply::DuplicateContact { contact_address }
        }
        EnrollError::NotReady(e) => EnrollReply::NotReady {
            reason: e.to_string(),
        },
        e @ (EnrollError::StorageUnavailable(_)
        | EnrollError::Probe(ProbeError::MalformedEmbedding(_))) => return Err(e.into()),
    })
}

/// Map a record result to a reply. Storage outages and malformed
/// extractor output stay `Err`.
pub fn record_reply(
    result: Result<RecordedAttendance, EngineError>,
) -> Result<RecordReply, EngineError> {
    let err = match result {
        Ok(recorded) => {
            return Ok(RecordReply::Recorded {
                event_id: recorded.event.event_id,
                identity: recorded.identity,
                date: recorded.event.date,
                session_tag: recorded.event.session_tag,
            })
        }
        Err(EngineError::Record(err)) => err,
        Err(other) => return Err(other),
    };
    Ok(match err {
        RecordError::MissingField(field) => RecordReply::MissingField {
            field: field.to_string(),
        },
        RecordError::Probe(ProbeError::NoFaceDetected) => RecordReply::NoFaceDetected,
        RecordError::Probe(ProbeError::MultipleFacesDetected(count)) => {
            RecordReply::MultipleFacesDetected { count }
        }
        RecordError::NoMatch { distance } => RecordReply::NoMatch {
            distance: distance.is_finite().then_some(distance),
        },
        RecordError::AlreadyMarked(identity) => RecordReply::AlreadyMarked { identity },
        RecordError::NotReady(e) => RecordReply::NotReady {
            reason: e.to_string(),
        },
        e @ (RecordError::StorageUnavailable(_)
        | RecordError::Probe(ProbeError::MalformedEmbedding(_))) => return Err(e.into()),
    })
}

fn parse_date_arg(name: &str, raw: &str) -> fdo::Result<Option<NaiveDate>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(None);
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map(Some)
        .map_err(|e| fdo::Error::InvalidArgs(format!("{name}: {e}")))
}

fn failed(op: &str, err: EngineError) -> fdo::Error {
    tracing::error!(op, error = %err, "request failed");
    fdo::Error::Failed(format!("{op} failed; see daemon log"))
}

fn to_json<T: Serialize>(value: &T) -> fdo::Result<String> {
    serde_json::to_string(value).map_err(|e| fdo::Error::Failed(e.to_string()))
}

/// D-Bus interface for the attendance daemon.
///
/// Bus name: io.rollcall.Attendance1
/// Object path: /io/rollcall/Attendance1
///
/// `Status` is open to any peer; every other method requires an operator.
pub struct AttendanceService {
    engine: EngineHandle,
    policy: OperatorPolicy,
}

impl AttendanceService {
    pub fn new(engine: EngineHandle, policy: OperatorPolicy) -> Self {
        Self { engine, policy }
    }
}

#[interface(name = "io.rollcall.Attendance1")]
impl AttendanceService {
    /// Enroll a new identity from a JSON `EnrollPayload`.
    async fn enroll(
        &self,
        payload: &str,
        #[zbus(connection)] conn: &zbus::Connection,
        #[zbus(header)] header: Header<'_>,
    ) -> fdo::Result<String> {
        self.policy.authorize("enroll", conn, &header).await?;
        let payload: EnrollPayload = serde_json::from_str(payload)
            .map_err(|e| fdo::Error::InvalidArgs(format!("enroll payload: {e}")))?;
        tracing::info!(identity_id = %payload.identity_id, "enroll requested");

        let result = match payload.into_candidate() {
            Ok(candidate) => self.engine.enroll(candidate).await,
            Err(e) => Err(e.into()),
        };
        let reply = enroll_reply(result).map_err(|e| failed("enroll", e))?;
        to_json(&reply)
    }

    /// Recognize the face in a JSON `RecordPayload` and mark attendance.
    async fn record(
        &self,
        payload: &str,
        #[zbus(connection)] conn: &zbus::Connection,
        #[zbus(header)] header: Header<'_>,
    ) -> fdo::Result<String> {
        self.policy.authorize("record", conn, &header).await?;
        let payload: RecordPayload = serde_json::from_str(payload)
            .map_err(|e| fdo::Error::InvalidArgs(format!("record payload: {e}")))?;
        tracing::info!(session = %payload.session_tag, "record requested");

        let result = match payload.into_probe() {
            Ok((probe, session_tag, date)) => self.engine.record(probe, session_tag, date).await,
            Err(e) => Err(e.into()),
        };
        let reply = record_reply(result).map_err(|e| failed("record", e))?;
        to_json(&reply)
    }

    /// Enrolled identities, without embeddings.
    async fn list_identities(
        &self,
        #[zbus(connection)] conn: &zbus::Connection,
        #[zbus(header)] header: Header<'_>,
    ) -> fdo::Result<String> {
        self.policy.authorize("list_identities", conn, &header).await?;
        let ids = self
            .engine
            .list_identities()
            .await
            .map_err(|e| failed("list_identities", e))?;
        to_json(&ids)
    }

    /// Attendance between `from` and `to` (YYYY-MM-DD, inclusive).
    /// Empty dates use the default window; empty or "all" group disables the filter.
    async fn report(
        &self,
        from: &str,
        to: &str,
        group: &str,
        #[zbus(connection)] conn: &zbus::Connection,
        #[zbus(header)] header: Header<'_>,
    ) -> fdo::Result<String> {
        self.policy.authorize("report", conn, &header).await?;
        let from = parse_date_arg("from", from)?;
        let to = parse_date_arg("to", to)?;
        tracing::info!(?from, ?to, group, "report requested");
        let rows = self
            .engine
            .report(from, to, Some(group.to_string()))
            .await
            .map_err(|e| failed("report", e))?;
        to_json(&rows)
    }

    /// Return daemon status information.
    async fn status(&self) -> fdo::Result<String> {
        let status = self.engine.status().await.map_err(|e| failed("status", e))?;
        to_json(&status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rollcall_core::{BoundingBox, StoreError};
    use serde_json::json;

    fn public(id: &str) -> PublicIdentity {
        PublicIdentity {
            identity_id: id.into(),
            display_name: format!("Student {id}"),
            contact_address: format!("{id}@x.com"),
            group_tag: "CS".into(),
        }
    }

    fn detected(values: Vec<f32>) -> DetectedFace {
        DetectedFace {
            bbox: BoundingBox {
                x: 0.0,
                y: 0.0,
                width: 10.0,
                height: 10.0,
                confidence: 0.9,
            },
            embedding: Embedding::new(values),
        }
    }

    #[test]
    fn test_duplicate_face_reply_json() {
        let reply = enroll_reply(Err(EnrollError::DuplicateFace(public("S1")).into())).unwrap();
        let value = serde_json::to_value(&reply).unwrap();
        assert_eq!(value["outcome"], "duplicate_face");
        assert_eq!(value["existing"]["identity_id"], "S1");
        assert_eq!(value["existing"]["contact_address"], "S1@x.com");
    }

    #[test]
    fn test_storage_failure_stays_an_error() {
        let err = EnrollError::StorageUnavailable(StoreError::Unavailable("db gone".into()));
        assert!(enroll_reply(Err(err.into())).is_err());

        let err = RecordError::StorageUnavailable(StoreError::Unavailable("db gone".into()));
        assert!(record_reply(Err(err.into())).is_err());
        assert!(record_reply(Err(EngineError::ChannelClosed)).is_err());

        let err = RecordError::Probe(ProbeError::MalformedEmbedding("expected 128-dim".into()));
        assert!(record_reply(Err(err.into())).is_err());
    }

    #[test]
    fn test_no_match_on_empty_gallery_omits_distance() {
        let reply = record_reply(Err(RecordError::NoMatch {
            distance: f32::INFINITY,
        }
        .into()))
        .unwrap();
        assert_eq!(reply, RecordReply::NoMatch { distance: None });
        assert_eq!(
            serde_json::to_value(&reply).unwrap(),
            json!({"outcome": "no_match", "distance": null})
        );
    }

    #[test]
    fn test_probe_errors_map_to_outcomes() {
        let reply =
            record_reply(Err(RecordError::Probe(ProbeError::MultipleFacesDetected(3)).into())).unwrap();
        assert_eq!(reply, RecordReply::MultipleFacesDetected { count: 3 });
        let reply = enroll_reply(Err(EnrollError::Probe(ProbeError::NoFaceDetected).into())).unwrap();
        assert_eq!(serde_json::to_value(&reply).unwrap(), json!({"outcome": "no_face_detected"}));
    }

    #[test]
    fn test_enroll_payload_checks_fields_before_faces() {
        let payload = EnrollPayload {
            identity_id: "S1".into(),
            display_name: "".into(),
            contact_address: "a@x.com".into(),
            group_tag: "CS".into(),
            faces: vec![],
        };
        assert!(matches!(
            payload.into_candidate(),
            Err(EnrollError::MissingField("display_name"))
        ));
    }

    #[test]
    fn test_enroll_payload_requires_one_face() {
        let payload: EnrollPayload = serde_json::from_value(json!({
            "identity_id": "S1",
            "display_name": "Ada",
            "contact_address": "a@x.com",
            "group_tag": "CS",
            "faces": [],
        }))
        .unwrap();
        assert!(matches!(
            payload.into_candidate(),
            Err(EnrollError::Probe(ProbeError::NoFaceDetected))
        ));
    }

    #[test]
    fn test_record_payload_date_optional() {
        let payload: RecordPayload = serde_json::from_value(json!({
            "session_tag": "morning",
            "faces": [serde_json::to_value(detected(vec![0.5; 4])).unwrap()],
        }))
        .unwrap();
        let (probe, session, date) = payload.into_probe().unwrap();
        assert_eq!(probe.dim(), 4);
        assert_eq!(session, "morning");
        assert_eq!(date, None);
    }

    #[test]
    fn test_parse_date_arg() {
        assert_eq!(parse_date_arg("from", "").unwrap(), None);
        assert_eq!(
            parse_date_arg("from", "2024-03-01").unwrap(),
            NaiveDate::from_ymd_opt(2024, 3, 1)
        );
        assert!(parse_date_arg("from", "03/01/2024").is_err());
    }
}
