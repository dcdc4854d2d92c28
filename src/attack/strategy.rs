//! Attack strategy variants and their per-packet drop predicates.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::{AttackConfig, AttackStrategyKind, MeshError, MeshResult, NodeId, Packet, SimTime};

/// Half-open simulated time interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: SimTime,
    pub end: SimTime,
}

impl TimeWindow {
    pub fn contains(&self, t: SimTime) -> bool {
        t >= self.start && t < self.end
    }
}

/// Predicate over packet fields. Every configured condition must hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PacketSelector {
    pub ttl_below: Option<u8>,
    pub min_size_bytes: Option<u32>,
}

impl PacketSelector {
    pub fn matches(&self, packet: &Packet) -> bool {
        let ttl_ok = self.ttl_below.map_or(true, |limit| packet.ttl < limit);
        let size_ok = self.min_size_bytes.map_or(true, |min| packet.size_bytes >= min);
        ttl_ok && size_ok
    }
}

/// The misbehavior an attack-augmented node runs, with its parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AttackStrategy {
    NoOperation,
    PacketDropPerc { p: f64 },
    PacketDropConnection { source: NodeId, destination: NodeId },
    PacketDropNeighbours { neighbours: BTreeSet<NodeId> },
    PacketDropInTime { windows: Vec<TimeWindow> },
    PacketDropSelect { selector: PacketSelector },
}

impl AttackStrategy {
    /// Build the strategy selected by the configuration, checking that the
    /// parameters it needs are present and sane.
    pub fn from_config(config: &AttackConfig) -> MeshResult<Self> {
        match config.strategy {
            AttackStrategyKind::NoOperation => Ok(Self::NoOperation),
            AttackStrategyKind::PacketDropPerc => {
                let p = config.percent_drop;
                if !(0.0..=1.0).contains(&p) {
                    return Err(MeshError::Config(format!(
                        "percent_drop must be in [0, 1], got {}",
                        p
                    )));
                }
                Ok(Self::PacketDropPerc { p })
            }
            AttackStrategyKind::PacketDropConnection => {
                let flow = config.target_flow.ok_or_else(|| {
                    MeshError::Config("PACKET_DROP_CONNECTION needs attack.target_flow".to_string())
                })?;
                Ok(Self::PacketDropConnection {
                    source: flow.source,
                    destination: flow.destination,
                })
            }
            AttackStrategyKind::PacketDropNeighbours => {
                if config.target_neighbours.is_empty() {
                    return Err(MeshError::Config(
                        "PACKET_DROP_NEIGHBOURS needs attack.target_neighbours".to_string(),
                    ));
                }
                Ok(Self::PacketDropNeighbours {
                    neighbours: config.target_neighbours.iter().copied().collect(),
                })
            }
            AttackStrategyKind::PacketDropInTime => {
                if config.drop_windows.is_empty() {
                    return Err(MeshError::Config(
                        "PACKET_DROP_IN_TIME needs attack.drop_windows".to_string(),
                    ));
                }
                let mut windows = Vec::with_capacity(config.drop_windows.len());
                for w in &config.drop_windows {
                    if w.end_secs <= w.start_secs {
                        return Err(MeshError::Config(format!(
                            "drop window [{}, {}) is empty",
                            w.start_secs, w.end_secs
                        )));
                    }
                    windows.push(TimeWindow {
                        start: w.start_secs,
                        end: w.end_secs,
                    });
                }
                Ok(Self::PacketDropInTime { windows })
            }
            AttackStrategyKind::PacketDropSelect => {
                let select = config.select.unwrap_or_default();
                if select.ttl_below.is_none() && select.min_size_bytes.is_none() {
                    return Err(MeshError::Config(
                        "PACKET_DROP_SELECT needs at least one attack.select condition".to_string(),
                    ));
                }
                Ok(Self::PacketDropSelect {
                    selector: PacketSelector {
                        ttl_below: select.ttl_below,
                        min_size_bytes: select.min_size_bytes,
                    },
                })
            }
        }
    }

    pub fn kind(&self) -> AttackStrategyKind {
        match self {
            Self::NoOperation => AttackStrategyKind::NoOperation,
            Self::PacketDropPerc { .. } => AttackStrategyKind::PacketDropPerc,
            Self::PacketDropConnection { .. } => AttackStrategyKind::PacketDropConnection,
            Self::PacketDropNeighbours { .. } => AttackStrategyKind::PacketDropNeighbours,
            Self::PacketDropInTime { .. } => AttackStrategyKind::PacketDropInTime,
            Self::PacketDropSelect { .. } => AttackStrategyKind::PacketDropSelect,
        }
    }

    /// Deterministic part of the decision: does this packet fall inside the
    /// attack's target set? For PACKET_DROP_PERC every packet is a target and
    /// the coin flip happens in the engine.
    pub fn targets(&self, packet: &Packet, now: SimTime) -> bool {
        match self {
            Self::NoOperation => false,
            Self::PacketDropPerc { p } => *p > 0.0,
            Self::PacketDropConnection {
                source,
                destination,
            } => packet.source == *source && packet.destination == *destination,
            Self::PacketDropNeighbours { neighbours } => {
                neighbours.contains(&packet.source) || neighbours.contains(&packet.destination)
            }
            Self::PacketDropInTime { windows } => windows.iter().any(|w| w.contains(now)),
            Self::PacketDropSelect { selector } => selector.matches(packet),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FlowConfig, MeshConfig, SelectorConfig, TimeWindowConfig};

    fn attack_config(kind: AttackStrategyKind) -> AttackConfig {
        let mut config = MeshConfig::default().attack;
        config.strategy = kind;
        config
    }

    #[test]
    fn test_connection_requires_flow() {
        let config = attack_config(AttackStrategyKind::PacketDropConnection);
        assert!(AttackStrategy::from_config(&config).is_err());
    }

    #[test]
    fn test_connection_targets_one_flow() {
        let mut config = attack_config(AttackStrategyKind::PacketDropConnection);
        config.target_flow = Some(FlowConfig {
            source: 5,
            destination: 0,
        });
        let strategy = AttackStrategy::from_config(&config).unwrap();
        assert!(strategy.targets(&Packet::new(1, 64, 5, 0, 800), 0.0));
        assert!(!strategy.targets(&Packet::new(1, 64, 0, 5, 800), 0.0));
        assert!(!strategy.targets(&Packet::new(1, 64, 6, 1, 800), 0.0));
    }

    #[test]
    fn test_neighbours_match_either_endpoint() {
        let mut config = attack_config(AttackStrategyKind::PacketDropNeighbours);
        config.target_neighbours = vec![3];
        let strategy = AttackStrategy::from_config(&config).unwrap();
        assert!(strategy.targets(&Packet::new(1, 64, 3, 9, 800), 0.0));
        assert!(strategy.targets(&Packet::new(1, 64, 9, 3, 800), 0.0));
        assert!(!strategy.targets(&Packet::new(1, 64, 8, 9, 800), 0.0));
    }

    #[test]
    fn test_time_windows_are_half_open() {
        let mut config = attack_config(AttackStrategyKind::PacketDropInTime);
        config.drop_windows = vec![TimeWindowConfig {
            start_secs: 10.0,
            end_secs: 20.0,
        }];
        let strategy = AttackStrategy::from_config(&config).unwrap();
        let packet = Packet::new(1, 64, 1, 2, 800);
        assert!(!strategy.targets(&packet, 9.99));
        assert!(strategy.targets(&packet, 10.0));
        assert!(!strategy.targets(&packet, 20.0));
    }

    #[test]
    fn test_empty_window_rejected() {
        let mut config = attack_config(AttackStrategyKind::PacketDropInTime);
        config.drop_windows = vec![TimeWindowConfig {
            start_secs: 5.0,
            end_secs: 5.0,
        }];
        assert!(AttackStrategy::from_config(&config).is_err());
    }

    #[test]
    fn test_selector_needs_every_condition() {
        let mut config = attack_config(AttackStrategyKind::PacketDropSelect);
        assert!(AttackStrategy::from_config(&config).is_err());

        config.select = Some(SelectorConfig {
            ttl_below: Some(32),
            min_size_bytes: Some(500),
        });
        let strategy = AttackStrategy::from_config(&config).unwrap();
        assert!(strategy.targets(&Packet::new(1, 31, 1, 2, 800), 0.0));
        assert!(!strategy.targets(&Packet::new(1, 32, 1, 2, 800), 0.0));
        assert!(!strategy.targets(&Packet::new(1, 31, 1, 2, 100), 0.0));
    }

    #[test]
    fn test_kind_roundtrip() {
        let config = attack_config(AttackStrategyKind::PacketDropPerc);
        let strategy = AttackStrategy::from_config(&config).unwrap();
        assert_eq!(strategy.kind(), AttackStrategyKind::PacketDropPerc);
    }
}
