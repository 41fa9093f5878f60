//! Parsing of device telemetry topic names.

use std::fmt;

/// A device telemetry topic, `site/{site}/{node|coord}/{id}/{kind}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceTopic {
    /// `site/{site}/node/{node}/telemetry`
    NodeTelemetry {
        /// Site id.
        site_id: String,
        /// Node id.
        node_id: String,
    },
    /// `site/{site}/coord/{coord}/telemetry`
    CoordinatorTelemetry {
        /// Site id.
        site_id: String,
        /// Coordinator id.
        coord_id: String,
    },
    /// `site/{site}/coord/{coord}/mmwave`
    Mmwave {
        /// Site id.
        site_id: String,
        /// Coordinator id.
        coord_id: String,
    },
}

impl DeviceTopic {
    /// Parses a concrete topic name. Returns `None` for anything that is not
    /// one of the three telemetry shapes.
    #[must_use]
    pub fn parse(topic: &str) -> Option<Self> {
        let mut levels = topic.split('/');
        let (Some("site"), Some(site), Some(role), Some(device), Some(kind), None) = (
            levels.next(),
            levels.next(),
            levels.next(),
            levels.next(),
            levels.next(),
            levels.next(),
        ) else {
            return None;
        };
        if site.is_empty() || device.is_empty() {
            return None;
        }

        let site_id = site.to_string();
        match (role, kind) {
            ("node", "telemetry") => Some(Self::NodeTelemetry {
                site_id,
                node_id: device.to_string(),
            }),
            ("coord", "telemetry") => Some(Self::CoordinatorTelemetry {
                site_id,
                coord_id: device.to_string(),
            }),
            ("coord", "mmwave") => Some(Self::Mmwave {
                site_id,
                coord_id: device.to_string(),
            }),
            _ => None,
        }
    }
}

impl fmt::Display for DeviceTopic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NodeTelemetry { site_id, node_id } => {
                write!(f, "site/{site_id}/node/{node_id}/telemetry")
            }
            Self::CoordinatorTelemetry { site_id, coord_id } => {
                write!(f, "site/{site_id}/coord/{coord_id}/telemetry")
            }
            Self::Mmwave { site_id, coord_id } => write!(f, "site/{site_id}/coord/{coord_id}/mmwave"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_the_three_shapes() {
        assert_eq!(
            DeviceTopic::parse("site/s1/node/n7/telemetry"),
            Some(DeviceTopic::NodeTelemetry {
                site_id: "s1".to_string(),
                node_id: "n7".to_string()
            })
        );
        assert_eq!(
            DeviceTopic::parse("site/s1/coord/c1/telemetry"),
            Some(DeviceTopic::CoordinatorTelemetry {
                site_id: "s1".to_string(),
                coord_id: "c1".to_string()
            })
        );
        assert_eq!(
            DeviceTopic::parse("site/s1/coord/c1/mmwave"),
            Some(DeviceTopic::Mmwave {
                site_id: "s1".to_string(),
                coord_id: "c1".to_string()
            })
        );
    }

    #[test]
    fn rejects_other_topics() {
        for topic in [
            "site/s1/node/n7/cmd",
            "site/s1/node/n7/mmwave",
            "site/s1/coord/c1/telemetry/extra",
            "site//coord/c1/telemetry",
            "zone/s1/coord/c1/telemetry",
            "site/s1/coord",
        ] {
            assert_eq!(DeviceTopic::parse(topic), None, "{topic}");
        }
    }

    #[test]
    fn display_round_trips() {
        let topic = "site/s1/coord/c1/mmwave";
        assert_eq!(
            DeviceTopic::parse(topic).map(|t| t.to_string()).as_deref(),
            Some(topic)
        );
    }
}
