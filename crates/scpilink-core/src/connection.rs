//! Connection management
//!
//! Handles the connection lifecycle, the command/response engine, and the
//! two-phase baud negotiation run at connection time.
//!
//! The wire protocol is asymmetric: a query's reply is its own success
//! signal, while a directive returns nothing, so the only way to know a
//! directive succeeded is to separately drain the instrument's error queue.
//! The engine therefore treats the two asymmetrically as well.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::ScpiError;
use crate::response::ScpiResponse;
use crate::serial::SerialOptions;
use crate::transport::{SerialTransport, Transport};
use crate::{DEFAULT_BAUD_RATE, DEFAULT_TIMEOUT_MS, FACTORY_BAUD_RATE, PROBE_TIMEOUT_MS};

/// Directive that moves the instrument to a new serial rate
const BAUD_COMMAND: &str = ":SYSTem:COMMunicate:SERial:BAUD";

/// Query reading back the active serial rate
const BAUD_QUERY: &str = "SYSTem:COMMunicate:SERial:BAUD?";

/// Query draining one entry from the instrument error queue
const ERROR_QUERY: &str = "SYSTem:ERRor?";

/// Directive returning the instrument to front-panel control
const LOCAL_COMMAND: &str = "SYSTem:LOCal";

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    /// Nothing opened yet; the instrument's rate is unknown
    Unknown,

    /// Probe session opened at the factory-default rate
    ProbeOpened,

    /// Read-back confirmed the target rate; the connection is live
    Negotiated,

    /// Negotiation gave up; the connection never became usable
    NegotiationFailed,

    /// Closed by [`Connection::close`]; subsequent calls fail
    Closed,
}

/// Connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Serial port name
    pub port_name: String,

    /// Target baud rate, confirmed by negotiation
    pub baud_rate: u32,

    /// Rate the instrument falls back to after a power cycle; the probe
    /// session opens at this rate
    pub probe_baud_rate: u32,

    /// Serial line options (parity, flow control)
    pub options: SerialOptions,

    /// Reply timeout in milliseconds
    pub timeout_ms: u64,

    /// Settle delay before each query in milliseconds, for instruments that
    /// need breathing room between successive queries
    pub ask_wait_ms: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            port_name: String::new(),
            baud_rate: DEFAULT_BAUD_RATE,
            probe_baud_rate: FACTORY_BAUD_RATE,
            options: SerialOptions::default(),
            timeout_ms: DEFAULT_TIMEOUT_MS,
            ask_wait_ms: 0,
        }
    }
}

/// A live instrument connection.
///
/// Owns exactly one transport session. Strictly request/reply: every call
/// blocks until a reply, a timeout, or a transport error, and `&mut self`
/// keeps at most one command in flight. Instruments on different ports get
/// independent connections with no shared state.
pub struct Connection {
    /// Transport session; `None` once closed
    transport: Option<Box<dyn Transport>>,
    /// Current connection state
    state: ConnectionState,
    /// Connection configuration
    config: ConnectionConfig,
    /// Reply deadline for queries, read at the start of each operation
    command_timeout: Duration,
    /// Settle delay before each query
    ask_wait: Duration,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("state", &self.state)
            .field("config", &self.config)
            .field("command_timeout", &self.command_timeout)
            .field("ask_wait", &self.ask_wait)
            .finish_non_exhaustive()
    }
}

/// Default opener: a serial transport session on the configured port.
fn open_serial(
    config: &ConnectionConfig,
    baud: u32,
    read_timeout: Duration,
) -> Result<Box<dyn Transport>, ScpiError> {
    let transport = SerialTransport::open(&config.port_name, baud, read_timeout, &config.options)?;
    Ok(Box::new(transport))
}

/// Wrap any error raised inside the handshake into the negotiation failure
/// the caller sees, keeping the original cause readable.
fn negotiation_error(e: ScpiError) -> ScpiError {
    match e {
        ScpiError::NegotiationFailed(_) => e,
        other => ScpiError::NegotiationFailed(other.to_string()),
    }
}

impl Connection {
    /// Connect to the instrument, negotiating it up to the target rate.
    ///
    /// The instrument's serial rate is not discoverable without sending
    /// something, and sending at the wrong rate produces garbage or silence.
    /// The handshake therefore runs in two phases: a best-effort retune sent
    /// at the factory-default rate, then a fresh session at the target rate
    /// whose read-back is the only state that gets trusted.
    ///
    /// Not retried automatically on failure; the caller decides whether to
    /// retry with different assumptions (e.g. another `probe_baud_rate`).
    pub fn connect(config: ConnectionConfig) -> Result<Self, ScpiError> {
        Self::connect_with(config, open_serial)
    }

    /// Connect through an injectable transport opener. `open` is called with
    /// the config, a baud rate, and a read timeout, once per session.
    fn connect_with<F>(config: ConnectionConfig, mut open: F) -> Result<Self, ScpiError>
    where
        F: FnMut(&ConnectionConfig, u32, Duration) -> Result<Box<dyn Transport>, ScpiError>,
    {
        info!(
            port = %config.port_name,
            target = config.baud_rate,
            probe = config.probe_baud_rate,
            "connecting"
        );

        // Phase one: the instrument may be at the factory rate, the target
        // rate, or whatever a previous session left it at. Flush line noise
        // with a bare terminator, then retune. At the wrong rate both writes
        // are garbage to the instrument, so nothing from this phase is
        // trusted and every write error is ignored.
        {
            let mut probe = open(
                &config,
                config.probe_baud_rate,
                Duration::from_millis(PROBE_TIMEOUT_MS),
            )
            .map_err(negotiation_error)?;
            debug!(baud = config.probe_baud_rate, "probe session opened");

            let _ = probe.write_all(b"\n");
            let _ =
                probe.write_all(format!("{} {}\n", BAUD_COMMAND, config.baud_rate).as_bytes());
        } // probe session fully closed before the target session opens

        // Phase two: a fresh session at the rate phase one just configured.
        let command_timeout = Duration::from_millis(config.timeout_ms);
        let transport =
            open(&config, config.baud_rate, command_timeout).map_err(negotiation_error)?;

        let mut conn = Self {
            transport: Some(transport),
            state: ConnectionState::ProbeOpened,
            command_timeout,
            ask_wait: Duration::from_millis(config.ask_wait_ms),
            config,
        };

        match conn.confirm_target_rate() {
            Ok(()) => {
                conn.state = ConnectionState::Negotiated;
                info!(baud = conn.config.baud_rate, "negotiated");
                Ok(conn)
            }
            Err(e) => {
                warn!(error = %e, "negotiation failed");
                conn.state = ConnectionState::NegotiationFailed;
                conn.transport = None;
                Err(negotiation_error(e))
            }
        }
    }

    /// Clear status and read the active rate back; only state reached from
    /// this fresh session is trusted.
    fn confirm_target_rate(&mut self) -> Result<(), ScpiError> {
        {
            let transport = self.transport_mut()?;
            transport.write_all(b"\n")?;
            transport.clear_input()?;
        }
        self.send_directive_unchecked("*CLS")?;

        let active: i64 = self.ask(BAUD_QUERY)?;
        if active != i64::from(self.config.baud_rate) {
            return Err(ScpiError::NegotiationFailed(format!(
                "instrument reports {} baud, expected {}",
                active, self.config.baud_rate
            )));
        }
        Ok(())
    }

    /// Wrap an already-open transport that is known to speak the target
    /// rate, skipping negotiation.
    ///
    /// Useful for links whose rate is fixed externally, and for exercising
    /// command tables against a scripted stream.
    pub fn with_transport(transport: Box<dyn Transport>, config: ConnectionConfig) -> Self {
        Self {
            transport: Some(transport),
            state: ConnectionState::Negotiated,
            command_timeout: Duration::from_millis(config.timeout_ms),
            ask_wait: Duration::from_millis(config.ask_wait_ms),
            config,
        }
    }

    /// List available serial ports
    pub fn list_ports() -> Vec<crate::serial::PortInfo> {
        crate::serial::list_ports()
    }

    /// Get current connection state
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Get the connection configuration
    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Get the current command timeout
    pub fn command_timeout(&self) -> Duration {
        self.command_timeout
    }

    /// Replace the command timeout for subsequent operations, returning the
    /// previous value so a caller can widen it around one long-running query
    /// and restore it afterwards.
    pub fn set_timeout(&mut self, timeout: Duration) -> Duration {
        std::mem::replace(&mut self.command_timeout, timeout)
    }

    /// Replace the settle delay applied before each query, returning the
    /// previous value.
    pub fn set_ask_wait(&mut self, wait: Duration) -> Duration {
        std::mem::replace(&mut self.ask_wait, wait)
    }

    fn transport_mut(&mut self) -> Result<&mut dyn Transport, ScpiError> {
        match self.transport.as_deref_mut() {
            Some(transport) => Ok(transport),
            None => Err(ScpiError::NotConnected),
        }
    }

    /// Send a directive and verify it through the instrument error queue.
    ///
    /// A directive returns no data, so success is confirmed by draining one
    /// entry from the error queue; a non-zero code fails with
    /// [`ScpiError::Instrument`].
    pub fn send_directive(&mut self, text: &str) -> Result<(), ScpiError> {
        self.send_directive_unchecked(text)?;
        self.check_error_queue(text)
    }

    /// Send a directive without the error-queue verification.
    ///
    /// For contexts where the instrument is known not to be able to answer
    /// the queue query yet, such as right after a baud change before the new
    /// session is confirmed.
    pub fn send_directive_unchecked(&mut self, text: &str) -> Result<(), ScpiError> {
        debug!(directive = text, "send");
        let transport = self.transport_mut()?;
        transport.write_all(format!("{}\n", text).as_bytes())
    }

    fn check_error_queue(&mut self, directive: &str) -> Result<(), ScpiError> {
        let reply: String = self.ask(ERROR_QUERY)?;
        let (code, message) = parse_error_reply(&reply)?;
        if code != 0 {
            warn!(code, message = %message, directive, "instrument reported an error");
            return Err(ScpiError::Instrument { code, message });
        }
        Ok(())
    }

    /// Issue a query and parse the single reply line as `T`.
    ///
    /// Waits the configured settle delay, clears stale input, writes the
    /// query, and reads one line within the command timeout.
    pub fn ask<T: ScpiResponse>(&mut self, query: &str) -> Result<T, ScpiError> {
        if !self.ask_wait.is_zero() {
            std::thread::sleep(self.ask_wait);
        }

        let timeout = self.command_timeout;
        let transport = self.transport_mut()?;
        transport.clear_input()?;
        transport.write_all(format!("{}\n", query).as_bytes())?;
        let line = transport.read_line(timeout)?;
        debug!(query, reply = %line, "ask");
        T::parse(&line)
    }

    /// Query a plain string reply
    pub fn ask_str(&mut self, query: &str) -> Result<String, ScpiError> {
        self.ask(query)
    }

    /// Query an integer reply
    pub fn ask_int(&mut self, query: &str) -> Result<i64, ScpiError> {
        self.ask(query)
    }

    /// Query a float reply
    pub fn ask_float(&mut self, query: &str) -> Result<f64, ScpiError> {
        self.ask(query)
    }

    /// Query an `ON`/`OFF` reply
    pub fn ask_bool(&mut self, query: &str) -> Result<bool, ScpiError> {
        self.ask(query)
    }

    /// Query a float reply where `OFF` means "no value"
    pub fn ask_float_off(&mut self, query: &str) -> Result<Option<f64>, ScpiError> {
        self.ask(query)
    }

    /// Query a comma-separated string list
    pub fn ask_str_list(&mut self, query: &str) -> Result<Vec<String>, ScpiError> {
        self.ask(query)
    }

    /// Query a comma-separated integer list
    pub fn ask_int_list(&mut self, query: &str) -> Result<Vec<i64>, ScpiError> {
        self.ask(query)
    }

    /// Query a comma-separated float list
    pub fn ask_float_list(&mut self, query: &str) -> Result<Vec<f64>, ScpiError> {
        self.ask(query)
    }

    /// Read the `*IDN?` identification as its comma-separated fields
    /// (manufacturer, model, serial number, firmware version)
    pub fn identify(&mut self) -> Result<Vec<String>, ScpiError> {
        self.ask("*IDN?")
    }

    /// Reset the instrument to its default state (`*RST`)
    pub fn reset(&mut self) -> Result<(), ScpiError> {
        self.send_directive("*RST")
    }

    /// Clear the status and error registers (`*CLS`).
    ///
    /// Unchecked: clearing empties the very queue a check would read.
    pub fn clear_status(&mut self) -> Result<(), ScpiError> {
        self.send_directive_unchecked("*CLS")
    }

    /// Hand the instrument back to front-panel control and close the
    /// transport session. Idempotent.
    pub fn close(&mut self) {
        if self.transport.is_some() {
            // Best effort; the instrument may already be gone
            if let Err(e) = self.send_directive_unchecked(LOCAL_COMMAND) {
                debug!(error = %e, "local-control directive failed during close");
            }
        }
        self.transport = None;
        self.state = ConnectionState::Closed;
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

/// Parse a `SYSTem:ERRor?` reply of the form `-221,"Settings conflict"`.
fn parse_error_reply(raw: &str) -> Result<(i32, String), ScpiError> {
    let raw = raw.trim();
    let (code, message) = match raw.split_once(',') {
        Some((code, message)) => (code, message),
        None => (raw, ""),
    };
    let code = code.trim().parse::<i32>().map_err(|_| ScpiError::Parse {
        expected: "error-queue entry",
        text: raw.to_string(),
    })?;
    Ok((code, message.trim().trim_matches('"').to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct MockState {
        written: Vec<String>,
        /// Scripted reply lines; `None` simulates a reply that never arrives
        replies: VecDeque<Option<String>>,
        last_max_wait: Option<Duration>,
        fail_writes: bool,
    }

    struct MockTransport {
        state: Arc<Mutex<MockState>>,
    }

    impl Transport for MockTransport {
        fn write_all(&mut self, bytes: &[u8]) -> Result<(), ScpiError> {
            let mut state = self.state.lock().unwrap();
            if state.fail_writes {
                return Err(ScpiError::Serial("write failed".to_string()));
            }
            state
                .written
                .push(String::from_utf8_lossy(bytes).to_string());
            Ok(())
        }

        fn read_line(&mut self, max_wait: Duration) -> Result<String, ScpiError> {
            let mut state = self.state.lock().unwrap();
            state.last_max_wait = Some(max_wait);
            match state.replies.pop_front() {
                Some(Some(line)) => Ok(line),
                _ => Err(ScpiError::Timeout),
            }
        }

        fn clear_input(&mut self) -> Result<(), ScpiError> {
            Ok(())
        }
    }

    fn scripted(replies: &[&str]) -> (Connection, Arc<Mutex<MockState>>) {
        let state = Arc::new(Mutex::new(MockState {
            replies: replies.iter().map(|r| Some(r.to_string())).collect(),
            ..MockState::default()
        }));
        let config = ConnectionConfig {
            port_name: "mock".to_string(),
            ..ConnectionConfig::default()
        };
        let conn = Connection::with_transport(
            Box::new(MockTransport {
                state: Arc::clone(&state),
            }),
            config,
        );
        (conn, state)
    }

    fn negotiate(readback: &str) -> (
        Result<Connection, ScpiError>,
        Arc<Mutex<MockState>>,
        Arc<Mutex<MockState>>,
    ) {
        negotiate_with(readback, false)
    }

    fn negotiate_with(
        readback: &str,
        probe_fails_writes: bool,
    ) -> (
        Result<Connection, ScpiError>,
        Arc<Mutex<MockState>>,
        Arc<Mutex<MockState>>,
    ) {
        let probe_state = Arc::new(Mutex::new(MockState {
            fail_writes: probe_fails_writes,
            ..MockState::default()
        }));
        let main_state = Arc::new(Mutex::new(MockState {
            replies: VecDeque::from([Some(readback.to_string())]),
            ..MockState::default()
        }));

        let config = ConnectionConfig {
            port_name: "mock".to_string(),
            ..ConnectionConfig::default()
        };

        let probe = Arc::clone(&probe_state);
        let main = Arc::clone(&main_state);
        let result = Connection::connect_with(config, move |_config, baud, _timeout| {
            let state = if baud == FACTORY_BAUD_RATE {
                Arc::clone(&probe)
            } else {
                Arc::clone(&main)
            };
            Ok(Box::new(MockTransport { state }) as Box<dyn Transport>)
        });
        (result, probe_state, main_state)
    }

    #[test]
    fn test_connection_config_default() {
        let config = ConnectionConfig::default();
        assert_eq!(config.baud_rate, DEFAULT_BAUD_RATE);
        assert_eq!(config.probe_baud_rate, FACTORY_BAUD_RATE);
        assert_eq!(config.timeout_ms, DEFAULT_TIMEOUT_MS);
        assert_eq!(config.ask_wait_ms, 0);
    }

    #[test]
    fn test_directive_checks_error_queue() {
        let (mut conn, state) = scripted(&["0,\"No error\""]);
        conn.send_directive("CONF:NETWork:TYPE GSM900").unwrap();

        let written = state.lock().unwrap().written.clone();
        assert_eq!(
            written,
            vec![
                "CONF:NETWork:TYPE GSM900\n".to_string(),
                "SYSTem:ERRor?\n".to_string(),
            ]
        );
    }

    #[test]
    fn test_directive_surfaces_instrument_error() {
        let (mut conn, _state) = scripted(&["-221,\"Settings conflict\""]);
        let err = conn.send_directive("CONF:CHAN:BTS:TSC 9").unwrap_err();
        match err {
            ScpiError::Instrument { code, message } => {
                assert_eq!(code, -221);
                assert_eq!(message, "Settings conflict");
            }
            other => panic!("expected instrument error, got {:?}", other),
        }
    }

    #[test]
    fn test_unchecked_directive_skips_queue() {
        let (mut conn, state) = scripted(&[]);
        conn.send_directive_unchecked("PROCedure:SYNChronize")
            .unwrap();

        let state = state.lock().unwrap();
        assert_eq!(state.written, vec!["PROCedure:SYNChronize\n".to_string()]);
        assert_eq!(state.last_max_wait, None);
    }

    #[test]
    fn test_ask_timeout_when_no_reply() {
        let (mut conn, _state) = scripted(&[]);
        let err = conn.ask_str("STATus:DEVice?").unwrap_err();
        assert!(matches!(err, ScpiError::Timeout));
    }

    #[test]
    fn test_ask_parses_declared_shape() {
        let (mut conn, _state) = scripted(&["124", "NARRow", "1.00,2.00,3.00", "ON"]);
        assert_eq!(conn.ask_int("CONF:CHAN:BTS:CCCH:ARFCN?").unwrap(), 124);
        assert_eq!(
            conn.ask_str("CONF:BANalysis:POWer:BANDwidth:INPut1?")
                .unwrap(),
            "NARRow"
        );
        assert_eq!(
            conn.ask_float_list("CONF:SPECtrum:MODulation:TOLerance?")
                .unwrap(),
            vec![1.0, 2.0, 3.0]
        );
        assert!(conn
            .ask_bool("CONF:SPECtrum:SWITching:NOISe:CORRection?")
            .unwrap());
    }

    #[test]
    fn test_ask_rejects_malformed_reply() {
        let (mut conn, _state) = scripted(&["NARRow"]);
        let err = conn.ask_int("CONF:CHAN:BTS:TSC?").unwrap_err();
        assert!(matches!(err, ScpiError::Parse { expected: "integer", .. }));
    }

    #[test]
    fn test_set_timeout_returns_previous_and_applies() {
        let (mut conn, state) = scripted(&["BIDL"]);
        let previous = conn.set_timeout(Duration::from_secs(60));
        assert_eq!(previous, Duration::from_millis(DEFAULT_TIMEOUT_MS));

        conn.ask_str("STATus:DEVice?").unwrap();
        assert_eq!(
            state.lock().unwrap().last_max_wait,
            Some(Duration::from_secs(60))
        );

        // Restore pattern: put the previous value back
        assert_eq!(conn.set_timeout(previous), Duration::from_secs(60));
    }

    #[test]
    fn test_set_ask_wait_returns_previous_and_applies() {
        let (mut conn, _state) = scripted(&["NONE"]);
        let previous = conn.set_ask_wait(Duration::from_millis(25));
        assert_eq!(previous, Duration::ZERO);

        let start = std::time::Instant::now();
        conn.ask_str("PROCedure:SEL?").unwrap();
        assert!(start.elapsed() >= Duration::from_millis(25));

        // Restore pattern, same as the timeout
        assert_eq!(conn.set_ask_wait(previous), Duration::from_millis(25));
    }

    #[test]
    fn test_identify_splits_fields() {
        let (mut conn, _state) =
            scripted(&["ROHDE&SCHWARZ,CMD57,102445/011,V2.30"]);
        assert_eq!(
            conn.identify().unwrap(),
            vec!["ROHDE&SCHWARZ", "CMD57", "102445/011", "V2.30"]
        );
    }

    #[test]
    fn test_close_sends_local_and_is_idempotent() {
        let (mut conn, state) = scripted(&[]);
        conn.close();
        conn.close();

        assert_eq!(conn.state(), ConnectionState::Closed);
        assert_eq!(
            state.lock().unwrap().written,
            vec!["SYSTem:LOCal\n".to_string()]
        );

        let err = conn.ask_str("STATus:DEVice?").unwrap_err();
        assert!(matches!(err, ScpiError::NotConnected));
        let err = conn.send_directive("PROCedure:SYNChronize").unwrap_err();
        assert!(matches!(err, ScpiError::NotConnected));
    }

    #[test]
    fn test_negotiation_reaches_target_rate() {
        let (result, probe_state, main_state) = negotiate("9600");
        let conn = result.unwrap();
        assert_eq!(conn.state(), ConnectionState::Negotiated);

        // Probe session carried the retune directive at the factory rate
        let probe_written = probe_state.lock().unwrap().written.clone();
        assert_eq!(
            probe_written,
            vec![
                "\n".to_string(),
                ":SYSTem:COMMunicate:SERial:BAUD 9600\n".to_string(),
            ]
        );

        // Fresh session cleared status before trusting the read-back
        let main_written = main_state.lock().unwrap().written.clone();
        assert!(main_written.contains(&"*CLS\n".to_string()));
        assert!(main_written.contains(&"SYSTem:COMMunicate:SERial:BAUD?\n".to_string()));
    }

    #[test]
    fn test_negotiation_fails_on_old_rate_readback() {
        let (result, _probe, _main) = negotiate("2400");
        let err = result.unwrap_err();
        match err {
            ScpiError::NegotiationFailed(cause) => {
                assert!(cause.contains("2400"));
                assert!(cause.contains("9600"));
            }
            other => panic!("expected negotiation failure, got {:?}", other),
        }
    }

    #[test]
    fn test_negotiation_ignores_probe_write_errors() {
        // A deaf or already-retuned instrument makes the probe writes fail
        // or vanish; only the fresh-session read-back decides the outcome
        let (result, _probe, _main) = negotiate_with("9600", true);
        assert_eq!(result.unwrap().state(), ConnectionState::Negotiated);
    }

    #[test]
    fn test_negotiation_wraps_transport_errors() {
        // Read-back line arrives empty, which parses as no rate at all
        let (result, _probe, _main) = negotiate_with("", false);
        assert!(matches!(
            result.unwrap_err(),
            ScpiError::NegotiationFailed(_)
        ));
    }

    #[test]
    fn test_parse_error_reply() {
        assert_eq!(
            parse_error_reply("0,\"No error\"").unwrap(),
            (0, "No error".to_string())
        );
        assert_eq!(
            parse_error_reply("-221,\"Settings conflict\"").unwrap(),
            (-221, "Settings conflict".to_string())
        );
        assert_eq!(parse_error_reply("0").unwrap(), (0, String::new()));
        assert!(parse_error_reply("garbage").is_err());
    }
}
