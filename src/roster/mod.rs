use std::collections::HashMap;
use log::{debug, info, warn};

use crate::models::{CalibrationAssets, ChannelDescriptor, Cursor, DeviceNode, Meter, PollDescriptor, Roster};
use crate::protocol::Catalog;

pub mod channels;

struct MeterDraft<'a> {
    node: &'a DeviceNode,
    leaves: Vec<&'a DeviceNode>,
}

/// Turn the flat device/channel tree into the ordered meter roster.
///
/// Bad records are logged and skipped, the caller decides what an empty
/// roster means.
pub fn build(nodes: &[DeviceNode], catalog: &Catalog) -> Roster {
    /* Collect the addressable meter roots, keyed by node id */
    let mut drafts: Vec<MeterDraft> = Vec::new();
    let mut by_id: HashMap<&str, usize> = HashMap::new();
    let mut seen_addresses: HashMap<u32, &str> = HashMap::new();

    for node in nodes.iter().filter(|n| n.is_meter_root()) {
        let address = match node.long_address {
            Some(a) => a,
            None => {
                warn!("{}: meter has no serial number (long address), not polled", node.display_name());
                continue;
            }
        };

        if by_id.contains_key(node.id.as_str()) {
            warn!("Meter node id {} is configured twice, keeping the first one", node.id);
            continue;
        }

        if let Some(other) = seen_addresses.get(&address) {
            warn!("{}: long address {} is already used by node {}, not polled", node.display_name(), address, other);
            continue;
        }

        seen_addresses.insert(address, node.id.as_str());
        by_id.insert(node.id.as_str(), drafts.len());
        drafts.push(MeterDraft { node, leaves: Vec::new() });
    }

    /* Attach the channels to their meters */
    for node in nodes.iter().filter(|n| !n.is_folder && !n.is_meter_root()) {
        match by_id.get(node.parent.as_str()) {
            Some(idx) => drafts[*idx].leaves.push(node),
            None => warn!("No meter node {:?} for channel {} ({:?}), skipped", node.parent, node.id, node.channel_code()),
        }
    }

    let meters = drafts.into_iter().map(|draft| build_meter(draft, catalog)).collect();
    let roster = Roster::from_meters(meters);
    info!("Roster built with {} meters", roster.len());
    roster
}

fn build_meter(draft: MeterDraft, catalog: &Catalog) -> Meter {
    let display_name = draft.node.display_name();
    let mut channels: HashMap<String, ChannelDescriptor> = HashMap::new();

    for leaf in draft.leaves.iter() {
        let code = match leaf.channel_code() {
            Some(c) => c.to_string(),
            None => {
                warn!("{display_name}: channel {} has no channel code, skipped", leaf.id);
                continue;
            }
        };

        if channels::describe(&code).is_none() {
            warn!("{display_name}: channel code {code} is not a known measurement");
        }

        let descriptor = ChannelDescriptor {
            external_id: leaf.id.clone(),
            channel_code: code.clone(),
            read_enabled: leaf.read_enabled,
            poll_time_factor: leaf.poll_time_factor.max(1),
        };

        if let Some(old) = channels.insert(code.clone(), descriptor) {
            debug!("{display_name}: channel {code} configured twice, {} replaced by {}", old.external_id, leaf.id);
        }
    }

    /* One poll per catalog entry, merged channels are polled as often as the most frequent one */
    let mut polls: Vec<PollDescriptor> = Vec::new();
    let mut enabled: Vec<&ChannelDescriptor> = channels.values().filter(|c| c.read_enabled).collect();
    enabled.sort_by(|a, b| a.channel_code.cmp(&b.channel_code));

    for chan in enabled {
        let template_index = match catalog.resolve(&chan.channel_code) {
            Some(idx) => idx,
            None => {
                warn!("{display_name}: no request for channel {} available, not polled", chan.channel_code);
                continue;
            }
        };

        /* a group match alone does not mean the answer carries this channel */
        match catalog.get(template_index) {
            Ok(t) if t.serves(&chan.channel_code) => {}
            _ => {
                warn!("{display_name}: channel {} is not served by request {}, not polled", chan.channel_code, template_index);
                continue;
            }
        }

        match polls.iter_mut().find(|p| p.template_index == template_index) {
            Some(poll) => poll.poll_time_factor = poll.poll_time_factor.min(chan.poll_time_factor),
            None => polls.push(PollDescriptor::new(template_index, chan.poll_time_factor)),
        }
    }
    polls.sort_by_key(|p| p.template_index);

    debug!("{display_name}: {} channels, {} polls", channels.len(), polls.len());

    Meter {
        long_address: draft.node.long_address.unwrap_or_default(),
        display_name,
        assets: CalibrationAssets::from_node(draft.node),
        channels,
        polls,
        cursor: Cursor::SessionOpen,
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::HashSet;

    pub(crate) fn meter_node(id: &str, address: Option<u32>) -> DeviceNode {
        DeviceNode {
            id: id.to_string(),
            parent: "place".to_string(),
            is_folder: true,
            node_kind: crate::models::NodeKind::MeterRoot,
            long_address: address,
            chan: Some(format!("Meter {id}")),
            ..Default::default()
        }
    }

    pub(crate) fn channel_node(id: &str, parent: &str, code: &str, factor: u32) -> DeviceNode {
        DeviceNode {
            id: id.to_string(),
            parent: parent.to_string(),
            chan: Some(code.to_string()),
            read_enabled: true,
            poll_time_factor: factor,
            ..Default::default()
        }
    }

    #[test]
    fn test_build_single_meter() {
        let nodes = vec![
            meter_node("n1", Some(555)),
            channel_node("c1", "n1", "U1", 1),
            channel_node("c2", "n1", "I1", 3),
        ];
        let catalog = Catalog::build();
        let roster = build(&nodes, &catalog);

        assert_eq!(roster.len(), 1);
        let meter = roster.get(0).unwrap();
        assert_eq!(meter.long_address, 555);
        assert_eq!(meter.display_name, "Meter n1");
        assert_eq!(meter.polls.len(), 2);
        assert!(meter.polls.iter().all(|p| p.countdown == 0));
        assert_eq!(meter.cursor, Cursor::SessionOpen);
        assert_eq!(meter.channels["U1"].external_id, "c1");

        /* polls follow the catalog order */
        let idx_i = catalog.resolve("I1").unwrap();
        let idx_u = catalog.resolve("U1").unwrap();
        assert_eq!(meter.polls[0], PollDescriptor { template_index: idx_i, poll_time_factor: 3, countdown: 0 });
        assert_eq!(meter.polls[1], PollDescriptor { template_index: idx_u, poll_time_factor: 1, countdown: 0 });
    }

    #[test]
    fn test_folders_only_give_empty_roster() {
        let nodes = vec![
            DeviceNode { id: "a".to_string(), is_folder: true, ..Default::default() },
            DeviceNode { id: "b".to_string(), parent: "a".to_string(), is_folder: true, ..Default::default() },
        ];
        assert!(build(&nodes, &Catalog::build()).is_empty());
    }

    #[test]
    fn test_orphan_channel_is_skipped() {
        let nodes = vec![
            meter_node("n1", Some(1)),
            channel_node("c1", "n1", "U1", 1),
            channel_node("c2", "n1", "U2", 1),
            channel_node("lost", "nowhere", "I1", 1),
        ];
        let roster = build(&nodes, &Catalog::build());
        let meter = roster.get(0).unwrap();
        assert_eq!(meter.channels.len(), 2);
        assert!(meter.channels.values().all(|c| c.external_id != "lost"));
        assert_eq!(meter.polls.len(), 1);
    }

    #[test]
    fn test_merge_takes_smallest_factor() {
        let nodes = vec![
            meter_node("n1", Some(1)),
            channel_node("c1", "n1", "I1", 5),
            channel_node("c2", "n1", "I2", 2),
        ];
        let roster = build(&nodes, &Catalog::build());
        let meter = roster.get(0).unwrap();
        assert_eq!(meter.polls.len(), 1);
        assert_eq!(meter.polls[0].poll_time_factor, 2);
    }

    #[test]
    fn test_meter_without_address_is_dropped() {
        let nodes = vec![
            meter_node("n1", None),
            channel_node("c1", "n1", "U1", 1),
            meter_node("n2", Some(2)),
        ];
        let roster = build(&nodes, &Catalog::build());
        assert_eq!(roster.len(), 1);
        assert_eq!(roster.get(0).unwrap().long_address, 2);
    }

    #[test]
    fn test_addresses_are_unique() {
        let nodes = vec![
            meter_node("n1", Some(10)),
            meter_node("n2", Some(20)),
            meter_node("n3", Some(10)),
            meter_node("n4", Some(30)),
        ];
        let roster = build(&nodes, &Catalog::build());
        let addresses: HashSet<u32> = roster.meters().iter().map(|m| m.long_address).collect();
        assert_eq!(addresses.len(), roster.len());
        assert_eq!(roster.len(), 3);
        assert_eq!(roster.position_of(30), Some(2));
    }

    #[test]
    fn test_disabled_and_unknown_channels_are_not_polled() {
        let mut disabled = channel_node("c1", "n1", "P0", 1);
        disabled.read_enabled = false;
        let nodes = vec![
            meter_node("n1", Some(1)),
            disabled,
            channel_node("c2", "n1", "T", 1),
            channel_node("c3", "n1", "f", 4),
        ];
        let catalog = Catalog::build();
        let roster = build(&nodes, &catalog);
        let meter = roster.get(0).unwrap();

        /* still routable, but only f is scheduled */
        assert_eq!(meter.channels.len(), 3);
        assert_eq!(meter.polls.len(), 1);
        assert_eq!(meter.polls[0].template_index, catalog.resolve("f").unwrap());
        assert_eq!(meter.polls[0].poll_time_factor, 4);
    }

    #[test]
    fn test_build_does_not_touch_input() {
        let nodes = vec![meter_node("n1", Some(1)), channel_node("c1", "n1", "U1", 2)];
        let copy = nodes.clone();
        let _ = build(&nodes, &Catalog::build());
        assert_eq!(nodes, copy);
    }

    #[test]
    fn test_channel_outside_template_is_not_polled() {
        let nodes = vec![
            meter_node("n1", Some(555)),
            channel_node("c1", "n1", "EAPS", 1),
            channel_node("c2", "n1", "EAMT1", 1),
        ];
        let catalog = Catalog::build();
        let roster = build(&nodes, &catalog);
        let meter = roster.get(0).unwrap();

        assert_eq!(meter.channels.len(), 2);
        assert!(meter.polls.is_empty());

        let mut with_total = nodes.clone();
        with_total.push(channel_node("c3", "n1", "EAP", 2));
        let roster = build(&with_total, &catalog);
        let meter = roster.get(0).unwrap();
        assert_eq!(meter.polls.len(), 1);
        assert_eq!(meter.polls[0].template_index, catalog.resolve("EAP").unwrap());
        assert_eq!(meter.polls[0].poll_time_factor, 2);
    }
}
