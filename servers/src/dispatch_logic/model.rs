use lib_dispatch::{
    ActionOutcome, AmbulanceId, AssignmentId, DriverAction, DriverId, NewReport, ReportId,
    ReportKind, UserId,
};
use serde::{Deserialize, Serialize};

/// Body of `POST /api/report/create`. The photo has already been stored by
/// the upload layer; only its URL arrives here.
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct CreateReportRequest {
    #[serde(rename = "type")]
    pub kind: ReportKind,
    pub latitude: f64,
    pub longitude: f64,
    pub description: Option<String>,
    pub destination: Option<String>,
    pub photo_url: Option<String>,
}

impl CreateReportRequest {
    pub fn into_new_report(self, reporter_id: UserId) -> NewReport {
        NewReport {
            reporter_id,
            kind: self.kind,
            latitude: self.latitude,
            longitude: self.longitude,
            description: self.description,
            destination: self.destination,
            photo_ref: self.photo_url,
        }
    }
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct CreateReportResponse {
    pub message: &'static str,
    pub report_id: ReportId,
    pub assignment_id: AssignmentId,
}

#[derive(Deserialize, Debug)]
pub struct DriverActionRequest {
    pub action: DriverAction,
}

#[derive(Serialize, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ActionResponse {
    pub message: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dispatch_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_assignment_id: Option<AssignmentId>,
}

impl From<&ActionOutcome> for ActionResponse {
    fn from(outcome: &ActionOutcome) -> Self {
        match outcome {
            ActionOutcome::Accepted { dispatch } => ActionResponse {
                message: "Assignment accepted",
                dispatch_id: Some(dispatch.id.0),
                next_assignment_id: None,
            },
            ActionOutcome::Reassigned { assignment } => ActionResponse {
                message: "Assignment cancelled, reassigned",
                dispatch_id: None,
                next_assignment_id: Some(assignment.id),
            },
            ActionOutcome::Exhausted { .. } => ActionResponse {
                message: "Assignment cancelled, report marked as unassignable",
                dispatch_id: None,
                next_assignment_id: None,
            },
            ActionOutcome::Unassignable => ActionResponse {
                message: "Assignment cancelled, no other ambulance available",
                dispatch_id: None,
                next_assignment_id: None,
            },
        }
    }
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    pub connected_responders: usize,
}

/// Messages a responder client sends over the socket.
#[derive(Deserialize, Debug, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientMessage {
    UpdateLocation { latitude: f64, longitude: f64 },
}

/// One entry of the in-memory fleet seed file.
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FleetSeed {
    pub driver_id: DriverId,
    pub ambulance_id: AmbulanceId,
    pub latitude: f64,
    pub longitude: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_request_accepts_wire_names() {
        let request: CreateReportRequest = serde_json::from_str(
            r#"{"type":"SOS","latitude":12.9,"longitude":77.6,"photoUrl":"/uploads/1_a.jpg"}"#,
        )
        .unwrap();
        let report = request.into_new_report(UserId(4));
        assert_eq!(report.kind, ReportKind::Sos);
        assert_eq!(report.photo_ref.as_deref(), Some("/uploads/1_a.jpg"));
        assert!(report.validate().is_ok());
    }

    #[test]
    fn location_update_message() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"updateLocation","latitude":1.0,"longitude":2.0}"#).unwrap();
        assert_eq!(msg, ClientMessage::UpdateLocation { latitude: 1.0, longitude: 2.0 });
    }

    #[test]
    fn driver_action_is_lowercase() {
        let body: DriverActionRequest = serde_json::from_str(r#"{"action":"cancel"}"#).unwrap();
        assert_eq!(body.action, DriverAction::Cancel);
        assert!(serde_json::from_str::<DriverActionRequest>(r#"{"action":"ignore"}"#).is_err());
    }
}
