//! VDV-435 message structures and their XML codec. Inbound payloads are
//! deserialized with explicit field aliases, dispatched on the root element
//! name; outbound responses are rendered by the codec itself so attributes
//! and namespace declarations come out exactly as the bus expects them.

use chrono::{SecondsFormat, Utc};
use serde::Deserialize;

#[derive(Debug)]
pub enum CodecError {
    UnknownMessage(String),
    Malformed(String),
}

impl std::fmt::Display for CodecError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::UnknownMessage(root) => write!(f, "unknown message structure {}", root),
            Self::Malformed(why) => write!(f, "malformed message: {}", why),
        }
    }
}

impl std::error::Error for CodecError {}

/// Inbound messages understood by the ITCS side of the bus.
#[derive(Debug, Clone)]
pub enum IomMessage {
    TechnicalVehicleLogOnRequest(TechnicalVehicleLogOnRequest),
    TechnicalVehicleLogOffRequest(TechnicalVehicleLogOffRequest),
    GnssPhysicalPositionData(GnssPhysicalPositionData),
}

impl IomMessage {
    /// Request/response messages, as opposed to pub/sub data publications.
    pub fn is_request(&self) -> bool {
        matches!(
            self,
            Self::TechnicalVehicleLogOnRequest(_) | Self::TechnicalVehicleLogOffRequest(_)
        )
    }

    pub fn vehicle_ref(&self) -> Option<&str> {
        match self {
            Self::TechnicalVehicleLogOnRequest(request) => Some(&request.vehicle_ref.value),
            Self::TechnicalVehicleLogOffRequest(request) => Some(&request.vehicle_ref.value),
            Self::GnssPhysicalPositionData(_) => None,
        }
    }
}

/// Parses a payload into the matching message structure, dispatching on the
/// root element name.
pub fn parse_message(payload: &[u8]) -> Result<IomMessage, CodecError> {
    let text = std::str::from_utf8(payload)
        .map_err(|why| CodecError::Malformed(why.to_string()))?;

    let root = root_element_name(text)
        .ok_or_else(|| CodecError::Malformed("no root element".to_owned()))?;

    match root {
        "TechnicalVehicleLogOnRequestStructure" | "TechnicalVehicleLogOnRequest" => {
            serde_xml_rs::from_str(text)
                .map(IomMessage::TechnicalVehicleLogOnRequest)
                .map_err(|why| CodecError::Malformed(why.to_string()))
        }
        "TechnicalVehicleLogOffRequestStructure" | "TechnicalVehicleLogOffRequest" => {
            serde_xml_rs::from_str(text)
                .map(IomMessage::TechnicalVehicleLogOffRequest)
                .map_err(|why| CodecError::Malformed(why.to_string()))
        }
        "GnssPhysicalPositionDataStructure" | "GnssPhysicalPositionData" => {
            serde_xml_rs::from_str(text)
                .map(IomMessage::GnssPhysicalPositionData)
                .map_err(|why| CodecError::Malformed(why.to_string()))
        }
        other => Err(CodecError::UnknownMessage(other.to_owned())),
    }
}

fn root_element_name(text: &str) -> Option<&str> {
    let mut rest = text;
    loop {
        let start = rest.find('<')?;
        let tag = &rest[start + 1..];
        if tag.starts_with('?') || tag.starts_with('!') {
            let end = tag.find('>')?;
            rest = &tag[end + 1..];
            continue;
        }
        let end = tag.find(|c: char| c.is_whitespace() || c == '>' || c == '/')?;
        return Some(&tag[..end]);
    }
}

// - inbound structures -

#[derive(Debug, Clone, Deserialize)]
pub struct VehicleRef {
    #[serde(default)]
    pub version: Option<String>,

    #[serde(rename = "$value")]
    pub value: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TechnicalVehicleLogOnRequest {
    #[serde(rename = "Timestamp", default)]
    pub timestamp: Option<String>,

    #[serde(rename = "MessageId", default)]
    pub message_id: Option<String>,

    #[serde(rename = "VehicleRef", alias = "netex:VehicleRef")]
    pub vehicle_ref: VehicleRef,

    #[serde(rename = "OnBoardUnitId", default)]
    pub onboard_unit_id: Option<String>,

    #[serde(rename = "BaseVersion", default)]
    pub base_version: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TechnicalVehicleLogOffRequest {
    #[serde(rename = "Timestamp", default)]
    pub timestamp: Option<String>,

    #[serde(rename = "MessageId", default)]
    pub message_id: Option<String>,

    #[serde(rename = "VehicleRef", alias = "netex:VehicleRef")]
    pub vehicle_ref: VehicleRef,

    #[serde(rename = "OnBoardUnitId", default)]
    pub onboard_unit_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GnssPhysicalPositionData {
    #[serde(rename = "Timestamp", default)]
    pub timestamp: Option<String>,

    #[serde(rename = "PublisherId", default)]
    pub publisher_id: Option<String>,

    #[serde(rename = "TimestampOfMeasurement")]
    pub timestamp_of_measurement: String,

    #[serde(rename = "GnssPhysicalPosition")]
    pub gnss_physical_position: GnssPhysicalPosition,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GnssPhysicalPosition {
    #[serde(rename = "WGS84PhysicalPosition")]
    pub wgs_84_physical_position: Wgs84PhysicalPosition,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Wgs84PhysicalPosition {
    #[serde(rename = "Latitude")]
    pub latitude: f64,

    #[serde(rename = "Longitude")]
    pub longitude: f64,
}

// - outbound structures -

pub const RESPONSE_CODE_DOUBLE_LOG_ON: &str = "doubleLogOn";
pub const RESPONSE_CODE_NOT_LOGGED_ON: &str = "vehicleNotLoggedOn";

/// Response to a technical log-on or log-off request: either empty response
/// data, or a response error with one of the defined codes.
#[derive(Debug, Clone)]
pub struct TechnicalLogOnOffResponse {
    kind: ResponseKind,
    message_id: String,
    timestamp: String,
    error_code: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseKind {
    LogOn,
    LogOff,
}

impl TechnicalLogOnOffResponse {
    pub fn data(kind: ResponseKind) -> Self {
        Self {
            kind,
            message_id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            error_code: None,
        }
    }

    pub fn error(kind: ResponseKind, code: &str) -> Self {
        Self {
            error_code: Some(code.to_owned()),
            ..Self::data(kind)
        }
    }

    pub fn is_error(&self) -> bool {
        self.error_code.is_some()
    }

    pub fn xml(&self) -> String {
        let name = match self.kind {
            ResponseKind::LogOn => "TechnicalVehicleLogOnResponseStructure",
            ResponseKind::LogOff => "TechnicalVehicleLogOffResponseStructure",
        };
        let body_name = match self.kind {
            ResponseKind::LogOn => "TechnicalVehicleLogOnResponse",
            ResponseKind::LogOff => "TechnicalVehicleLogOffResponse",
        };

        let body = match &self.error_code {
            None => format!("<{data}></{data}>", data = format!("{}Data", body_name)),
            Some(code) => format!(
                "<{error}><{code_tag}>{code}</{code_tag}></{error}>",
                error = format!("{}Error", body_name),
                code_tag = format!("{}Code", body_name),
                code = code
            ),
        };

        format!(
            concat!(
                "<?xml version=\"1.0\" encoding=\"utf-8\"?>",
                "<{name} version=\"1.0\">",
                "<Timestamp>{timestamp}</Timestamp>",
                "<MessageId>{message_id}</MessageId>",
                "<CommonResponseCode>{common}</CommonResponseCode>",
                "{body}",
                "</{name}>"
            ),
            name = name,
            timestamp = self.timestamp,
            message_id = self.message_id,
            common = if self.error_code.is_some() {
                "messageUnderstood"
            } else {
                "ok"
            },
            body = body,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LOG_ON_REQUEST: &str = r#"<?xml version="1.0" encoding="utf-8"?>
        <TechnicalVehicleLogOnRequestStructure version="1.0" xmlns:netex="http://www.netex.org.uk/netex">
            <Timestamp>2024-07-05T12:30:00+00:00</Timestamp>
            <MessageId>9e2b62dc-3a4a-4f5c-b0d5-000000000001</MessageId>
            <netex:VehicleRef version="any">bus-4711</netex:VehicleRef>
        </TechnicalVehicleLogOnRequestStructure>"#;

    const GNSS_DATA: &str = r#"<?xml version="1.0" encoding="utf-8"?>
        <GnssPhysicalPositionDataStructure version="1.0">
            <Timestamp>2024-07-05T12:30:02+00:00</Timestamp>
            <PublisherId>obu-4711</PublisherId>
            <TimestampOfMeasurement>2024-07-05T12:30:00+00:00</TimestampOfMeasurement>
            <GnssPhysicalPosition>
                <WGS84PhysicalPosition>
                    <Latitude>54.323</Latitude>
                    <Longitude>10.134</Longitude>
                </WGS84PhysicalPosition>
            </GnssPhysicalPosition>
        </GnssPhysicalPositionDataStructure>"#;

    #[test]
    fn log_on_request_parses_with_namespaced_vehicle_ref() {
        let message = parse_message(LOG_ON_REQUEST.as_bytes()).unwrap();
        assert!(message.is_request());
        assert_eq!(message.vehicle_ref(), Some("bus-4711"));
    }

    #[test]
    fn gnss_data_parses_position_and_measurement_timestamp() {
        let message = parse_message(GNSS_DATA.as_bytes()).unwrap();
        assert!(!message.is_request());

        match message {
            IomMessage::GnssPhysicalPositionData(data) => {
                assert_eq!(data.timestamp_of_measurement, "2024-07-05T12:30:00+00:00");
                let position = data.gnss_physical_position.wgs_84_physical_position;
                assert!((position.latitude - 54.323).abs() < 1e-9);
                assert!((position.longitude - 10.134).abs() < 1e-9);
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn unknown_root_elements_are_rejected() {
        let result = parse_message(b"<SomethingElseStructure/>");
        assert!(matches!(result, Err(CodecError::UnknownMessage(_))));
    }

    #[test]
    fn truncated_payloads_are_malformed() {
        let truncated = &LOG_ON_REQUEST[..80];
        assert!(matches!(
            parse_message(truncated.as_bytes()),
            Err(CodecError::Malformed(_))
        ));
    }

    #[test]
    fn log_on_response_data_renders_ok() {
        let response = TechnicalLogOnOffResponse::data(ResponseKind::LogOn);
        let xml = response.xml();

        assert!(xml.contains("<TechnicalVehicleLogOnResponseStructure version=\"1.0\">"));
        assert!(xml.contains("<CommonResponseCode>ok</CommonResponseCode>"));
        assert!(xml.contains("<TechnicalVehicleLogOnResponseData>"));
        assert!(!response.is_error());
    }

    #[test]
    fn log_off_error_response_carries_the_code() {
        let response =
            TechnicalLogOnOffResponse::error(ResponseKind::LogOff, RESPONSE_CODE_NOT_LOGGED_ON);
        let xml = response.xml();

        assert!(xml.contains("<TechnicalVehicleLogOffResponseError>"));
        assert!(xml.contains(
            "<TechnicalVehicleLogOffResponseCode>vehicleNotLoggedOn</TechnicalVehicleLogOffResponseCode>"
        ));
        assert!(xml.contains("<CommonResponseCode>messageUnderstood</CommonResponseCode>"));
        assert!(response.is_error());
    }
}
