//! Inbound routing of one broker message into its table mappings.
//!
//! A message moves through `Received → Decoded → Routed(n)` and ends
//! `Complete` or `Failed`. Every matched route config decodes the payload
//! with its own format; mappings of all matched configs are merged and
//! written in priority order.

use crate::audit::MessageAudit;
use crate::codec;
use crate::error::BridgeError;
use crate::filter;
use crate::insert::Inserter;
use crate::model::{RouteConfig, TableMapping};
use crate::topic;
use crate::value::FieldMap;
use std::cmp::Reverse;
use std::collections::HashMap;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageState {
    Received,
    Decoded,
    /// Number of mappings scheduled for writing
    Routed(usize),
    Complete,
    Failed,
}

/// Result of one attempted mapping, or of a config whose payload could not be decoded
#[derive(Debug, Clone, PartialEq)]
pub struct MappingOutcome {
    pub config_name: String,
    /// `schema.table`; `None` for config-level failures
    pub target: Option<String>,
    pub success: bool,
    pub rows_affected: u64,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RoutingReport {
    pub topic: String,
    pub state: MessageState,
    pub success_count: usize,
    pub outcomes: Vec<MappingOutcome>,
    /// One event per matched route config, in config order
    pub audits: Vec<MessageAudit>,
}

struct Scheduled<'a> {
    config: usize,
    route: &'a RouteConfig,
    mapping: &'a TableMapping,
    fields: &'a FieldMap,
}

#[derive(Default)]
struct ConfigTally {
    tables_affected: u32,
    errors: Vec<String>,
}

pub struct InboundRouter {
    inserter: Inserter,
}

impl InboundRouter {
    pub fn new(inserter: Inserter) -> Self {
        Self { inserter }
    }

    pub fn inserter(&self) -> &Inserter {
        &self.inserter
    }

    /// Route one message against a config snapshot
    pub async fn route(&self, topic: &str, payload: &[u8], routes: &[RouteConfig]) -> RoutingReport {
        let mut state = MessageState::Received;
        let matched: Vec<&RouteConfig> = routes
            .iter()
            .filter(|route| route.enabled && topic::matches(topic, &route.topic_pattern))
            .collect();

        if matched.is_empty() {
            debug!("No route config matches topic {}", topic);
            return RoutingReport {
                topic: topic.to_string(),
                state: MessageState::Complete,
                success_count: 0,
                outcomes: Vec::new(),
                audits: Vec::new(),
            };
        }

        // Decode once per distinct format
        let mut decoded: HashMap<String, Result<FieldMap, String>> = HashMap::new();
        for route in &matched {
            let key = route.message_format.trim().to_ascii_uppercase();
            decoded.entry(key).or_insert_with(|| {
                codec::decode(payload, &route.message_format).map_err(|e| e.to_string())
            });
        }

        let mut outcomes = Vec::new();
        let mut tallies: Vec<ConfigTally> = matched.iter().map(|_| ConfigTally::default()).collect();
        let mut failed = false;
        let mut scheduled = Vec::new();

        for (idx, route) in matched.iter().copied().enumerate() {
            let key = route.message_format.trim().to_ascii_uppercase();
            match decoded.get(&key) {
                Some(Ok(fields)) => {
                    scheduled.extend(route.table_mappings.iter().filter(|m| m.enabled).map(
                        move |mapping| Scheduled {
                            config: idx,
                            route,
                            mapping,
                            fields,
                        },
                    ));
                }
                Some(Err(error)) => {
                    warn!(
                        "Failed to decode message on {} for config '{}': {}",
                        topic, route.name, error
                    );
                    failed = true;
                    tallies[idx].errors.push(error.clone());
                    outcomes.push(MappingOutcome {
                        config_name: route.name.clone(),
                        target: None,
                        success: false,
                        rows_affected: 0,
                        error: Some(error.clone()),
                    });
                }
                None => {}
            }
        }
        if scheduled.is_empty() && failed {
            return Self::finish(topic, MessageState::Failed, 0, outcomes, &matched, tallies);
        }
        state = Self::advance(state, MessageState::Decoded);

        // Stable sort keeps declaration order (and config order) among equal priorities
        scheduled.sort_by_key(|s| Reverse(s.mapping.priority));
        state = Self::advance(state, MessageState::Routed(scheduled.len()));

        let mut success_count = 0;
        for item in &scheduled {
            if let Some(condition) = item.mapping.filter() {
                if !filter::evaluate(condition, item.fields) {
                    debug!(
                        "Filter '{}' excluded message from {}",
                        condition,
                        item.mapping.target()
                    );
                    continue;
                }
            }

            let result = match item.route.column_mapping_for(item.mapping) {
                Some(columns) => self.inserter.write(item.mapping, columns, item.fields).await,
                None => Err(BridgeError::mapping(format!(
                    "No column mapping defined for {}",
                    item.mapping.target()
                ))),
            };

            let tally = &mut tallies[item.config];
            match result {
                Ok(rows_affected) => {
                    success_count += 1;
                    tally.tables_affected += 1;
                    debug!("Wrote message from {} to {}", topic, item.mapping.target());
                    outcomes.push(MappingOutcome {
                        config_name: item.route.name.clone(),
                        target: Some(item.mapping.target()),
                        success: true,
                        rows_affected,
                        error: None,
                    });
                }
                Err(e) => {
                    let error = e.to_string();
                    warn!(
                        "Mapping to {} failed for message on {}: {}",
                        item.mapping.target(),
                        topic,
                        error
                    );
                    tally.errors.push(error.clone());
                    outcomes.push(MappingOutcome {
                        config_name: item.route.name.clone(),
                        target: Some(item.mapping.target()),
                        success: false,
                        rows_affected: 0,
                        error: Some(error),
                    });
                    if !item.mapping.continue_on_error {
                        warn!(
                            "Mapping to {} stops on error, abandoning remaining mappings",
                            item.mapping.target()
                        );
                        failed = true;
                        break;
                    }
                }
            }
        }

        let final_state = if failed {
            MessageState::Failed
        } else {
            MessageState::Complete
        };
        debug!("Message on {} moved from {:?} to {:?}", topic, state, final_state);
        Self::finish(topic, final_state, success_count, outcomes, &matched, tallies)
    }

    fn advance(from: MessageState, to: MessageState) -> MessageState {
        debug!("Message state {:?} -> {:?}", from, to);
        to
    }

    fn finish(
        topic: &str,
        state: MessageState,
        success_count: usize,
        outcomes: Vec<MappingOutcome>,
        matched: &[&RouteConfig],
        tallies: Vec<ConfigTally>,
    ) -> RoutingReport {
        let audits = matched
            .iter()
            .zip(tallies)
            .map(|(route, tally)| MessageAudit {
                topic: topic.to_string(),
                config_name: route.name.clone(),
                success: tally.errors.is_empty(),
                tables_affected: tally.tables_affected,
                error_message: if tally.errors.is_empty() {
                    None
                } else {
                    Some(tally.errors.join("; "))
                },
            })
            .collect();

        info!(
            "Processed message on {}: {} configs matched, {} tables written, state {:?}",
            topic,
            matched.len(),
            success_count,
            state
        );

        RoutingReport {
            topic: topic.to_string(),
            state,
            success_count,
            outcomes,
            audits,
        }
    }
}
