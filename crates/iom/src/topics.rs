/// A parameterized IoM topic-level structure together with its QoS.
/// Placeholders in braces are substituted in two stages: globally known
/// values (organisation, ITCS id) at construction, per-message values at
/// publish time; unresolved placeholders stay in place.
#[derive(Debug, Clone)]
pub struct TopicStructure {
    pattern: String,
    pub qos: u8,
}

impl TopicStructure {
    pub fn new(pattern: impl Into<String>, qos: u8) -> Self {
        Self {
            pattern: pattern.into(),
            qos,
        }
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn resolve(&self, arguments: &[(&str, &str)]) -> TopicStructure {
        let mut pattern = self.pattern.clone();
        for (key, value) in arguments {
            pattern = pattern.replace(&format!("{{{}}}", key), value);
        }
        TopicStructure { pattern, qos: self.qos }
    }

    /// MQTT-style topic filter matching: `+` matches exactly one level, `#`
    /// matches the rest of the topic.
    pub fn matches(&self, topic: &str) -> bool {
        let mut pattern_segments = self.pattern.split('/');
        let mut topic_segments = topic.split('/');

        loop {
            match (pattern_segments.next(), topic_segments.next()) {
                (Some("#"), _) => return true,
                (Some("+"), Some(_)) => continue,
                (Some(pattern), Some(segment)) if pattern == segment => continue,
                (None, None) => return true,
                _ => return false,
            }
        }
    }
}

/// Value of the topic level following the given keyword level, e.g. the
/// vehicle ref after the literal `Vehicle`.
pub fn topic_value<'a>(topic: &'a str, keyword: &str) -> Option<&'a str> {
    let mut segments = topic.split('/');
    while let Some(segment) = segments.next() {
        if segment == keyword {
            return segments.next();
        }
    }
    None
}

/// The topic-level structures of the ITCS side of the bus, with the global
/// placeholders already substituted.
#[derive(Debug, Clone)]
pub struct TopicSet {
    pub sub_itcs_inbox: TopicStructure,
    pub pub_vehicle_inbox: TopicStructure,
    pub sub_vehicle_physical_position: TopicStructure,
    pub pub_itcs_inbox: TopicStructure,
}

impl TopicSet {
    pub fn new(organisation_id: &str, itcs_id: &str) -> Self {
        let globals: &[(&str, &str)] = &[
            ("organisation_id", organisation_id),
            ("itcs_id", itcs_id),
        ];

        Self {
            sub_itcs_inbox: TopicStructure::new(
                "IoM/1.0/DataVersion/+/Inbox/ItcsInbox/Country/de/+/Organisation/{organisation_id}/+/ItcsId/{itcs_id}/#",
                2,
            )
            .resolve(globals),
            pub_vehicle_inbox: TopicStructure::new(
                "IoM/1.0/DataVersion/{data_version}/Inbox/VehicleInbox/Country/de/any/Organisation/{organisation_id}/any/VehicleId/{vehicle_id}/CorrelationId/{correlation_id}/ResponseData",
                2,
            )
            .resolve(globals),
            sub_vehicle_physical_position: TopicStructure::new(
                "IoM/1.0/DataVersion/+/Country/de/+/Organisation/{organisation_id}/+/Vehicle/+/+/PhysicalPosition/#",
                0,
            )
            .resolve(globals),
            pub_itcs_inbox: TopicStructure::new(
                "IoM/1.0/DataVersion/any/Inbox/ItcsInbox/Country/de/any/Organisation/{organisation_id}/any/ItcsId/{itcs_id}/CorrelationId/{correlation_id}/RequestData",
                2,
            )
            .resolve(globals),
        }
    }

    pub fn subscriptions(&self) -> Vec<&TopicStructure> {
        vec![&self.sub_itcs_inbox, &self.sub_vehicle_physical_position]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn topics() -> TopicSet {
        TopicSet::new("VKG", "1")
    }

    #[test]
    fn global_placeholders_are_substituted() {
        let topics = topics();
        assert!(topics.sub_itcs_inbox.pattern().contains("/Organisation/VKG/"));
        assert!(topics.sub_itcs_inbox.pattern().contains("/ItcsId/1/"));
        assert!(topics.pub_vehicle_inbox.pattern().contains("{vehicle_id}"));
    }

    #[test]
    fn wildcard_matching_covers_plus_and_hash() {
        let topics = topics();

        assert!(topics.sub_itcs_inbox.matches(
            "IoM/1.0/DataVersion/1.2/Inbox/ItcsInbox/Country/de/any/Organisation/VKG/any/ItcsId/1/CorrelationId/77/RequestData"
        ));
        assert!(topics.sub_vehicle_physical_position.matches(
            "IoM/1.0/DataVersion/1.2/Country/de/any/Organisation/VKG/any/Vehicle/bus-1/any/PhysicalPosition/GnssPhysicalPositionData"
        ));
        assert!(!topics.sub_itcs_inbox.matches(
            "IoM/1.0/DataVersion/1.2/Inbox/ItcsInbox/Country/de/any/Organisation/OTHER/any/ItcsId/1/CorrelationId/77/RequestData"
        ));
    }

    #[test]
    fn publish_topic_resolves_per_message_arguments() {
        let topics = topics();
        let resolved = topics.pub_vehicle_inbox.resolve(&[
            ("data_version", "1.2"),
            ("vehicle_id", "bus-1"),
            ("correlation_id", "77"),
        ]);

        assert_eq!(
            resolved.pattern(),
            "IoM/1.0/DataVersion/1.2/Inbox/VehicleInbox/Country/de/any/Organisation/VKG/any/VehicleId/bus-1/CorrelationId/77/ResponseData"
        );
        assert_eq!(resolved.qos, 2);
    }

    #[test]
    fn keyword_lookup_extracts_topic_values() {
        let topic = "IoM/1.0/DataVersion/1.2/Country/de/any/Organisation/VKG/any/Vehicle/bus-1/any/PhysicalPosition/GnssPhysicalPositionData";
        assert_eq!(topic_value(topic, "Vehicle"), Some("bus-1"));
        assert_eq!(topic_value(topic, "DataVersion"), Some("1.2"));
        assert_eq!(topic_value(topic, "CorrelationId"), None);
    }
}
