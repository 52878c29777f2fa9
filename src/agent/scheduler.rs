use std::time::{Duration, Instant};
use log::{debug, error, info, warn};

use crate::models::{Cursor, PollDescriptor, Roster};
use crate::mqtt::{ChannelRecord, MeteringData};
use crate::protocol::{self, Catalog};
use crate::{get_id, get_unix_ts};
use super::AgentError;

pub const DEFAULT_MAX_TIMEOUTS: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq)]
struct InFlight {
    address: u32,
    /* None while the session open request is outstanding */
    poll: Option<usize>,
    sent_at: Instant,
}

/// A bound frame ready to go on the wire
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub frame: Vec<u8>,
    pub address: u32,
    pub meter_name: String,
    pub session_open: bool,
}

/// The polling state machine without any I/O.
///
/// Walks the roster meter by meter, opens a session on every meter switch,
/// fires the due polls of the current meter and keeps at most one request
/// outstanding. All methods are called from the agent task only.
pub struct PollScheduler {
    catalog: Catalog,
    roster: Roster,
    position: usize,
    in_flight: Option<InFlight>,
    timeout: Duration,
    max_timeouts: u32,
    errors: u32,
    discard_next: bool,
    restart_pending: bool,
}

/* Visit the polls from `start` on, every visited poll ticks once */
fn next_due(polls: &mut [PollDescriptor], start: usize) -> Option<usize> {
    for idx in start..polls.len() {
        if polls[idx].tick() {
            return Some(idx);
        }
    }
    None
}

impl PollScheduler {
    pub fn new(roster: Roster, timeout: Duration, max_timeouts: u32) -> Result<Self, AgentError> {
        if roster.is_empty() {
            return Err(AgentError::EmptyRoster);
        }

        let mut roster = roster;
        roster.reset_cursors();

        Ok(PollScheduler {
            catalog: Catalog::build(),
            roster,
            position: 0,
            in_flight: None,
            timeout,
            max_timeouts: max_timeouts.max(1),
            errors: 0,
            discard_next: false,
            restart_pending: false,
        })
    }

    pub fn roster(&self) -> &Roster {
        &self.roster
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn is_waiting(&self) -> bool {
        self.in_flight.is_some()
    }

    pub fn errors(&self) -> u32 {
        self.errors
    }

    /// Swap in a freshly built roster. The request on the wire is left alone,
    /// only its answer gets thrown away.
    pub fn reload(&mut self, roster: Roster) -> Result<(), AgentError> {
        if roster.is_empty() {
            return Err(AgentError::EmptyRoster);
        }

        let mut roster = roster;
        roster.reset_cursors();
        self.roster = roster;
        self.position = 0;
        self.discard_next = true;
        self.restart_pending = true;
        info!("Meter list replaced, {} meters, polling restarts with the first one", self.roster.len());
        Ok(())
    }

    fn skip_to_next_meter(&mut self) {
        self.position = (self.position + 1) % self.roster.len();
        if let Some(meter) = self.roster.get_mut(self.position) {
            meter.cursor = Cursor::SessionOpen;
        }
    }

    /// Pick the next request and mark it outstanding. Returns None while an
    /// answer is still pending.
    pub fn next_request(&mut self, now: Instant) -> Option<Request> {
        if self.in_flight.is_some() {
            debug!("Request still outstanding, nothing sent");
            return None;
        }

        if self.roster.is_empty() {
            return None;
        }

        if self.position >= self.roster.len() {
            self.position = 0;
        }
        self.restart_pending = false;

        /* At most two rounds: the current meter, then the session open of the next one */
        let (body, poll) = loop {
            let meter = self.roster.get_mut(self.position)?;
            match meter.cursor {
                Cursor::SessionOpen => {
                    meter.cursor = Cursor::Next(0);
                    break (protocol::session_open_request(&meter.assets), None);
                }
                Cursor::Next(start) => match next_due(&mut meter.polls, start) {
                    Some(idx) => {
                        meter.cursor = Cursor::Next(idx + 1);
                        let template = match self.catalog.get(meter.polls[idx].template_index) {
                            Ok(t) => t,
                            Err(e) => {
                                error!("{}: {e}", meter.display_name);
                                continue;
                            }
                        };
                        break (template.request.clone(), Some(idx));
                    }
                    None => self.skip_to_next_meter(),
                },
            }
        };

        let meter = self.roster.get(self.position)?;
        let frame = protocol::bind_address_and_checksum(&body, meter.long_address);
        self.in_flight = Some(InFlight { address: meter.long_address, poll, sent_at: now });

        Some(Request {
            frame,
            address: meter.long_address,
            meter_name: meter.display_name.clone(),
            session_open: poll.is_none(),
        })
    }

    /// Watchdog step. Gives up the current meter on a timeout and hands back
    /// the session open of the next one, or escalates after too many timeouts
    /// in a row.
    pub fn check_timeout(&mut self, now: Instant) -> Result<Option<Request>, AgentError> {
        let in_flight = match self.in_flight {
            Some(f) => f,
            None => return Ok(None),
        };

        if now.saturating_duration_since(in_flight.sent_at) <= self.timeout {
            return Ok(None);
        }

        self.errors += 1;
        if self.errors >= self.max_timeouts {
            return Err(AgentError::Liveness(self.errors));
        }

        error!("Timeout error for meter {}! Number of errors = {}", in_flight.address, self.errors);
        self.in_flight = None;

        /* after a reload the new first meter has not been asked yet */
        if !self.restart_pending {
            self.skip_to_next_meter();
        }
        Ok(self.next_request(now))
    }

    /// Handle one inbound chunk. The outstanding marker is cleared whatever
    /// the outcome, errors only concern this single message.
    pub fn handle_response(&mut self, frame: &[u8]) -> Result<Option<MeteringData>, AgentError> {
        let in_flight = self.in_flight.take();
        self.errors = 0;

        if self.discard_next {
            self.discard_next = false;
            debug!("Meter list was refreshed, answer ignored");
            return Ok(None);
        }

        protocol::validate(frame)?;
        let address = protocol::extract_sender_address(frame)?;
        let pos = self.roster.position_of(address).ok_or(AgentError::UnknownMeter(address))?;
        let meter = self.roster.get(pos).ok_or(AgentError::UnknownMeter(address))?;

        let in_flight = in_flight
            .filter(|f| f.address == address)
            .ok_or(AgentError::UnexpectedReply(address))?;

        let poll_idx = match in_flight.poll {
            Some(idx) => idx,
            None => {
                protocol::check_session_reply(frame)?;
                debug!("{}: session opened", meter.display_name);
                return Ok(None);
            }
        };

        let template_index = meter.polls.get(poll_idx)
            .map(|p| p.template_index)
            .ok_or(AgentError::UnexpectedReply(address))?;
        let template = self.catalog.get(template_index)?;
        let values = protocol::decode_payload(frame, template, &meter.assets)?;

        let ts = chrono::Utc::now().timestamp_millis();
        let mut records = Vec::new();
        for value in values {
            match meter.channels.get(&value.channel) {
                Some(chan) => records.push(ChannelRecord {
                    external_id: chan.external_id.clone(),
                    channel: value.channel,
                    value: value.value,
                    timestamp: ts,
                    meter_name: meter.display_name.clone(),
                }),
                None => warn!("Not found channel {} for {}", value.channel, meter.display_name),
            }
        }

        if records.is_empty() {
            return Ok(None);
        }

        Ok(Some(MeteringData {
            id: get_id("meterlink".to_string(), &meter.display_name),
            meter_name: meter.display_name.clone(),
            long_address: address,
            transmission_time: get_unix_ts(),
            records,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::roster::{self, tests::{channel_node, meter_node}};

    const TIMEOUT: Duration = Duration::from_millis(5000);

    fn roster_of(nodes: Vec<crate::models::DeviceNode>) -> Roster {
        roster::build(&nodes, &Catalog::build())
    }

    fn two_meters() -> Roster {
        roster_of(vec![
            meter_node("n1", Some(555)),
            channel_node("c1", "n1", "U1", 1),
            channel_node("c2", "n1", "I1", 3),
            meter_node("n2", Some(777)),
            channel_node("c3", "n2", "f", 1),
        ])
    }

    fn reply(address: u32, body: &[u8]) -> Vec<u8> {
        protocol::bind_address_and_checksum(body, address)
    }

    fn values(address: u32, raw: &[u32]) -> Vec<u8> {
        let body: Vec<u8> = raw.iter().flat_map(|v| v.to_be_bytes()).collect();
        reply(address, &body)
    }

    /* Send, then answer with a session accepted status or data */
    fn step(s: &mut PollScheduler, now: Instant) -> Request {
        let req = s.next_request(now).expect("request expected");
        let answer = match req.session_open {
            true => reply(req.address, &[0x00]),
            false => values(req.address, &[1, 2, 3]),
        };
        let _ = s.handle_response(&answer);
        req
    }

    fn describe(req: &Request) -> String {
        match req.session_open {
            true => format!("open:{}", req.address),
            false => format!("{}:{:02x}", req.address, req.frame[6]),
        }
    }

    #[test]
    fn test_empty_roster_is_refused() {
        assert!(matches!(PollScheduler::new(Roster::default(), TIMEOUT, 10), Err(AgentError::EmptyRoster)));
    }

    #[test]
    fn test_poll_sequence_with_decimation() {
        let mut s = PollScheduler::new(two_meters(), TIMEOUT, 10).unwrap();
        let now = Instant::now();
        let seq: Vec<String> = (0..12).map(|_| describe(&step(&mut s, now))).collect();

        /* I (0x21) has factor 3, U (0x11) every pass */
        assert_eq!(seq, vec![
            "open:555", "555:21", "555:11",
            "open:777", "777:40",
            "open:555", "555:11",
            "open:777", "777:40",
            "open:555", "555:11",
            "open:777",
        ]);
        let seq: Vec<String> = (0..3).map(|_| describe(&step(&mut s, now))).collect();
        assert_eq!(seq, vec!["777:40", "open:555", "555:21"]);
    }

    #[test]
    fn test_decimation_fires_once_per_factor() {
        let roster = roster_of(vec![meter_node("n1", Some(1)), channel_node("c1", "n1", "P0", 4)]);
        let mut s = PollScheduler::new(roster, TIMEOUT, 10).unwrap();
        let now = Instant::now();

        let fired = (0..40).map(|_| step(&mut s, now)).filter(|r| !r.session_open).count();
        /* every pass is open + (maybe) P, 4 passes per firing */
        let opens = 40 - fired;
        assert_eq!(fired, (opens + 3) / 4);
        let poll = &s.roster().get(0).unwrap().polls[0];
        assert!(poll.countdown < poll.poll_time_factor);
    }

    #[test]
    fn test_single_flight() {
        let mut s = PollScheduler::new(two_meters(), TIMEOUT, 10).unwrap();
        let now = Instant::now();
        assert!(s.next_request(now).is_some());
        assert!(s.is_waiting());
        assert!(s.next_request(now).is_none());
        assert!(s.next_request(now).is_none());

        let _ = s.handle_response(&reply(555, &[0x00]));
        assert!(!s.is_waiting());
        assert!(s.next_request(now).is_some());
    }

    #[test]
    fn test_decoded_values_are_routed() {
        let mut s = PollScheduler::new(two_meters(), TIMEOUT, 10).unwrap();
        let now = Instant::now();
        step(&mut s, now);
        step(&mut s, now);

        let req = s.next_request(now).unwrap();
        assert_eq!(req.frame[6], 0x11);
        let data = s.handle_response(&values(555, &[23012, 23000, 22900])).unwrap().unwrap();

        assert_eq!(data.long_address, 555);
        assert_eq!(data.meter_name, "Meter n1");
        /* only U1 is configured, U2 and U3 are dropped */
        assert_eq!(data.records.len(), 1);
        assert_eq!(data.records[0].external_id, "c1");
        assert_eq!(data.records[0].channel, "U1");
        assert_eq!(data.records[0].value, 230.12);
    }

    #[test]
    fn test_bad_frames_keep_the_loop_going() {
        let mut s = PollScheduler::new(two_meters(), TIMEOUT, 10).unwrap();
        let now = Instant::now();

        s.next_request(now).unwrap();
        let mut broken = reply(555, &[0x00]);
        broken[4] = 0x42;
        assert!(matches!(s.handle_response(&broken), Err(AgentError::Protocol(_))));
        assert!(!s.is_waiting());

        s.next_request(now).unwrap();
        assert!(matches!(s.handle_response(&reply(999, &[0x00])), Err(AgentError::UnknownMeter(999))));
        assert!(s.next_request(now).is_some());
    }

    #[test]
    fn test_timeout_skips_meter() {
        let mut s = PollScheduler::new(two_meters(), TIMEOUT, 10).unwrap();
        let t0 = Instant::now();
        step(&mut s, t0);
        s.next_request(t0).unwrap();

        assert!(s.check_timeout(t0 + Duration::from_millis(4000)).unwrap().is_none());
        let retry = s.check_timeout(t0 + Duration::from_millis(5001)).unwrap().unwrap();
        assert!(retry.session_open);
        assert_eq!(retry.address, 777);
        assert_eq!(s.errors(), 1);
        assert_eq!(s.position(), 1);
        assert!(s.is_waiting());
    }

    #[test]
    fn test_escalation_after_ten_timeouts() {
        let mut s = PollScheduler::new(two_meters(), TIMEOUT, DEFAULT_MAX_TIMEOUTS).unwrap();
        let mut now = Instant::now();
        s.next_request(now).unwrap();

        for i in 1..10 {
            now += Duration::from_secs(6);
            let retry = s.check_timeout(now).unwrap();
            assert!(retry.is_some());
            assert_eq!(s.errors(), i);
        }

        now += Duration::from_secs(6);
        assert!(matches!(s.check_timeout(now), Err(AgentError::Liveness(10))));
    }

    #[test]
    fn test_answer_resets_error_counter() {
        let mut s = PollScheduler::new(two_meters(), TIMEOUT, DEFAULT_MAX_TIMEOUTS).unwrap();
        let mut now = Instant::now();
        s.next_request(now).unwrap();

        for _ in 0..9 {
            now += Duration::from_secs(6);
            s.check_timeout(now).unwrap();
        }
        assert_eq!(s.errors(), 9);

        /* even a broken answer proves the link is alive */
        let _ = s.handle_response(&[0x00, 0x01]);
        assert_eq!(s.errors(), 0);

        s.next_request(now).unwrap();
        now += Duration::from_secs(6);
        assert!(s.check_timeout(now).unwrap().is_some());
        assert_eq!(s.errors(), 1);
    }

    #[test]
    fn test_reload_discards_first_answer() {
        let mut s = PollScheduler::new(two_meters(), TIMEOUT, 10).unwrap();
        let now = Instant::now();
        step(&mut s, now);
        step(&mut s, now);
        s.next_request(now).unwrap();
        assert_eq!(s.position(), 0);

        let fresh = roster_of(vec![meter_node("m9", Some(999)), channel_node("x1", "m9", "U1", 1)]);
        s.reload(fresh).unwrap();
        assert_eq!(s.roster().len(), 1);
        assert!(s.is_waiting());

        /* the pending U answer of the old roster is thrown away, even though it is valid */
        assert!(matches!(s.handle_response(&values(555, &[1, 2, 3])), Ok(None)));

        let open = s.next_request(now).unwrap();
        assert!(open.session_open);
        assert_eq!(open.address, 999);
        s.handle_response(&reply(999, &[0x00])).unwrap();

        let req = s.next_request(now).unwrap();
        assert_eq!(req.address, 999);
        let data = s.handle_response(&values(999, &[22000, 0, 0])).unwrap().unwrap();
        assert_eq!(data.records[0].external_id, "x1");
    }

    #[test]
    fn test_reload_with_empty_roster_keeps_old_one() {
        let mut s = PollScheduler::new(two_meters(), TIMEOUT, 10).unwrap();
        assert!(matches!(s.reload(Roster::default()), Err(AgentError::EmptyRoster)));
        assert_eq!(s.roster().len(), 2);
    }

    #[test]
    fn test_timeout_after_reload_starts_with_first_meter() {
        let mut s = PollScheduler::new(two_meters(), TIMEOUT, 10).unwrap();
        let t0 = Instant::now();
        s.next_request(t0).unwrap();

        s.reload(two_meters()).unwrap();
        let retry = s.check_timeout(t0 + Duration::from_secs(6)).unwrap().unwrap();
        assert_eq!(retry.address, 555);
        assert!(retry.session_open);
    }

    #[test]
    fn test_meter_without_polls_only_opens() {
        let roster = roster_of(vec![meter_node("n1", Some(5))]);
        let mut s = PollScheduler::new(roster, TIMEOUT, 10).unwrap();
        let now = Instant::now();
        for _ in 0..3 {
            let req = step(&mut s, now);
            assert!(req.session_open);
            assert_eq!(req.address, 5);
        }
    }
}
