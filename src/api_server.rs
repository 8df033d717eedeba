//! Remote API: named command handlers, argument coercion, the push sink
//! and the bits of HTTP the transport task needs.
//!
//! Commands arrive as `GET /cmd?name=value` query pairs. They are queued
//! to the controller task and dispatched there; the transport never calls
//! a handler itself.

use core::fmt::Write;

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;
use heapless::{FnvIndexMap, String};

use crate::event_bits::{EventBits, EVT_CONFIG_CHANGED};

pub const MAX_COMMANDS: usize = 32;
pub const CMD_NAME_LEN: usize = 40;
pub const CMD_ARG_LEN: usize = 32;
pub const CMD_QUEUE_LEN: usize = 8;

/// Event name of the full state push
pub const EVENT_STATE: &str = "hw_app_state";
/// Event name of the liveness push
pub const EVENT_HEARTBEAT: &str = "heartbeat";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ApiError {
    RegistryFull,
    NameTooLong,
    ArgTooLong,
}

/// Command handler, one variant per argument shape.
pub enum Handler<T> {
    Void(fn(&mut T)),
    Float(fn(&mut T, f32)),
    Int(fn(&mut T, i32)),
    Str(fn(&mut T, &str)),
}

impl<T> Clone for Handler<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Handler<T> {}

impl<T> Handler<T> {
    /// Calls the handler with `arg` coerced to its argument shape.
    pub fn invoke(self, target: &mut T, arg: &str) {
        match self {
            Handler::Void(f) => f(target),
            Handler::Float(f) => f(target, parse_float_prefix(arg)),
            Handler::Int(f) => f(target, parse_int_prefix(arg)),
            Handler::Str(f) => f(target, arg),
        }
    }
}

pub struct ApiServer<T> {
    handlers: FnvIndexMap<&'static str, Handler<T>, MAX_COMMANDS>,
}

impl<T> ApiServer<T> {
    pub fn new() -> Self {
        Self {
            handlers: FnvIndexMap::new(),
        }
    }

    pub fn register(&mut self, name: &'static str, handler: Handler<T>) -> Result<(), ApiError> {
        if name.len() > CMD_NAME_LEN {
            return Err(ApiError::NameTooLong);
        }
        self.handlers
            .insert(name, handler)
            .map(|_| ())
            .map_err(|_| ApiError::RegistryFull)
    }

    pub fn register_void(&mut self, name: &'static str, f: fn(&mut T)) -> Result<(), ApiError> {
        self.register(name, Handler::Void(f))
    }

    pub fn register_float(&mut self, name: &'static str, f: fn(&mut T, f32)) -> Result<(), ApiError> {
        self.register(name, Handler::Float(f))
    }

    pub fn register_int(&mut self, name: &'static str, f: fn(&mut T, i32)) -> Result<(), ApiError> {
        self.register(name, Handler::Int(f))
    }

    pub fn register_str(&mut self, name: &'static str, f: fn(&mut T, &str)) -> Result<(), ApiError> {
        self.register(name, Handler::Str(f))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn lookup(&self, name: &str) -> Option<Handler<T>> {
        self.handlers.get(name).copied()
    }

}

impl<T> Default for ApiServer<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Boolean arguments are true only for the literal `true`.
pub fn parse_bool(text: &str) -> bool {
    text == "true"
}

fn skip_sign_and_digits(bytes: &[u8], mut i: usize) -> (usize, usize) {
    if matches!(bytes.get(i), Some(b'+' | b'-')) {
        i += 1;
    }
    let start = i;
    while matches!(bytes.get(i), Some(b'0'..=b'9')) {
        i += 1;
    }
    (i, i - start)
}

/// Parses the longest numeric prefix after leading whitespace; zero if
/// there is none.
pub fn parse_float_prefix(text: &str) -> f32 {
    let text = text.trim_start();
    let bytes = text.as_bytes();
    let (mut end, mut digits) = skip_sign_and_digits(bytes, 0);
    if bytes.get(end) == Some(&b'.') {
        let mut i = end + 1;
        while matches!(bytes.get(i), Some(b'0'..=b'9')) {
            i += 1;
            digits += 1;
        }
        if digits > 0 {
            end = i;
        }
    }
    if digits == 0 {
        return 0.0;
    }
    if matches!(bytes.get(end), Some(b'e' | b'E')) {
        let (exp_end, exp_digits) = skip_sign_and_digits(bytes, end + 1);
        if exp_digits > 0 {
            end = exp_end;
        }
    }
    text[..end].parse().unwrap_or(0.0)
}

/// Integer variant of [`parse_float_prefix`], saturating on overflow.
pub fn parse_int_prefix(text: &str) -> i32 {
    let text = text.trim_start();
    let bytes = text.as_bytes();
    let (negative, start) = match bytes.first() {
        Some(b'-') => (true, 1),
        Some(b'+') => (false, 1),
        _ => (false, 0),
    };
    let mut value: i32 = 0;
    for b in bytes[start..].iter().take_while(|b| b.is_ascii_digit()) {
        let d = (b - b'0') as i32;
        value = if negative {
            value.saturating_mul(10).saturating_sub(d)
        } else {
            value.saturating_mul(10).saturating_add(d)
        };
    }
    value
}

/// Receiver of server pushed events.
pub trait PushSink {
    fn send(&mut self, payload: &str, event: &'static str);
}

/// One command taken from a remote request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandRequest {
    pub name: String<CMD_NAME_LEN>,
    pub arg: String<CMD_ARG_LEN>,
}

impl CommandRequest {
    pub fn new(name: &str, arg: &str) -> Result<Self, ApiError> {
        let mut req = Self {
            name: String::new(),
            arg: String::new(),
        };
        req.name.push_str(name).map_err(|_| ApiError::NameTooLong)?;
        req.arg.push_str(arg).map_err(|_| ApiError::ArgTooLong)?;
        Ok(req)
    }
}

/// Commands from the transport task to the controller task.
pub type CommandQueue = Channel<CriticalSectionRawMutex, CommandRequest, CMD_QUEUE_LEN>;

/// Queues the commands of a `/cmd` query string for the controller task
/// and returns how many were queued.
///
/// The controller only drains the queue on `EVT_CONFIG_CHANGED`, so the
/// bit is raised ahead of every send. A request with more pairs than the
/// queue holds then waits for the controller instead of blocking it.
pub async fn submit_commands(query: &str, queue: &CommandQueue, bits: &EventBits) -> usize {
    let mut queued = 0;
    for (name, value) in query_pairs(query) {
        match CommandRequest::new(name, value) {
            Ok(cmd) => {
                bits.raise(EVT_CONFIG_CHANGED);
                queue.send(cmd).await;
                queued += 1;
            }
            Err(e) => log_warn!("API: command {} dropped: {:?}", name, e),
        }
    }
    bits.raise(EVT_CONFIG_CHANGED);
    queued
}

/// Request target of the HTTP endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route<'a> {
    /// `/cmd` with its query string
    Command(&'a str),
    /// `/events` server-sent event stream
    Events,
    NotFound,
}

/// Routes the request line `GET <target> HTTP/1.x`. Only GET is served.
pub fn route_request(request_line: &str) -> Route<'_> {
    let mut parts = request_line.split_ascii_whitespace();
    let (Some("GET"), Some(target)) = (parts.next(), parts.next()) else {
        return Route::NotFound;
    };
    let (path, query) = target.split_once('?').unwrap_or((target, ""));
    match path {
        "/cmd" => Route::Command(query),
        "/events" => Route::Events,
        _ => Route::NotFound,
    }
}

/// `name=value` pairs of a query string; a pair without `=` has an empty
/// value.
pub fn query_pairs(query: &str) -> impl Iterator<Item = (&str, &str)> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| pair.split_once('=').unwrap_or((pair, "")))
}

/// Formats one server-sent event. `data` must be a single line.
pub fn format_sse<const N: usize>(
    out: &mut String<N>,
    event: &str,
    data: &str,
) -> core::fmt::Result {
    out.clear();
    write!(out, "event: {}\ndata: {}\n\n", event, data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Target {
        calls: std::vec::Vec<std::string::String>,
    }

    fn void_cb(t: &mut Target) {
        t.calls.push("void".into());
    }

    fn float_cb(t: &mut Target, v: f32) {
        t.calls.push(format!("float {}", v));
    }

    fn int_cb(t: &mut Target, v: i32) {
        t.calls.push(format!("int {}", v));
    }

    fn str_cb(t: &mut Target, v: &str) {
        t.calls.push(format!("str {} {}", v, parse_bool(v)));
    }

    fn run(api: &ApiServer<Target>, t: &mut Target, name: &str, arg: &str) -> bool {
        api.lookup(name).map(|h| h.invoke(t, arg)).is_some()
    }

    fn server() -> ApiServer<Target> {
        let mut api = ApiServer::new();
        api.register_void("trigger", void_cb).unwrap();
        api.register_float("set_f", float_cb).unwrap();
        api.register_int("set_i", int_cb).unwrap();
        api.register_str("set_b", str_cb).unwrap();
        api
    }

    #[test]
    fn dispatch_by_argument_shape() {
        let api = server();
        let mut t = Target::default();
        assert!(run(&api, &mut t, "trigger", "ignored"));
        assert!(run(&api, &mut t, "set_f", "12.5"));
        assert!(run(&api, &mut t, "set_i", "-42"));
        assert!(run(&api, &mut t, "set_b", "true"));
        assert!(run(&api, &mut t, "set_b", "True"));
        assert_eq!(
            t.calls,
            vec!["void", "float 12.5", "int -42", "str true true", "str True false"]
        );
    }

    #[test]
    fn unknown_command_is_ignored() {
        let api = server();
        let mut t = Target::default();
        assert!(!run(&api, &mut t, "format_flash", "1"));
        assert!(t.calls.is_empty());
    }

    #[test]
    fn invalid_numbers_coerce_to_zero() {
        let api = server();
        let mut t = Target::default();
        run(&api, &mut t, "set_f", "abc");
        run(&api, &mut t, "set_i", "");
        assert_eq!(t.calls, vec!["float 0", "int 0"]);
    }

    #[test]
    fn numeric_prefix_parsing() {
        assert_eq!(parse_float_prefix("  3.5kHz"), 3.5);
        assert_eq!(parse_float_prefix("-.25"), -0.25);
        assert_eq!(parse_float_prefix("7."), 7.0);
        assert_eq!(parse_float_prefix("1e3x"), 1000.0);
        assert_eq!(parse_float_prefix("2e"), 2.0);
        assert_eq!(parse_float_prefix("."), 0.0);
        assert_eq!(parse_float_prefix("-"), 0.0);
        assert_eq!(parse_int_prefix("12.9"), 12);
        assert_eq!(parse_int_prefix(" +7"), 7);
        assert_eq!(parse_int_prefix("99999999999"), i32::MAX);
        assert_eq!(parse_int_prefix("-99999999999"), i32::MIN);
    }

    #[test]
    fn registry_capacity() {
        let mut api: ApiServer<Target> = ApiServer::new();
        const NAMES: [&str; MAX_COMMANDS + 1] = [
            "c0", "c1", "c2", "c3", "c4", "c5", "c6", "c7", "c8", "c9", "c10", "c11", "c12",
            "c13", "c14", "c15", "c16", "c17", "c18", "c19", "c20", "c21", "c22", "c23", "c24",
            "c25", "c26", "c27", "c28", "c29", "c30", "c31", "c32",
        ];
        for name in &NAMES[..MAX_COMMANDS] {
            api.register_void(name, void_cb).unwrap();
        }
        assert_eq!(
            api.register_void(NAMES[MAX_COMMANDS], void_cb),
            Err(ApiError::RegistryFull)
        );
        // Re-registering replaces
        assert!(api.register_float("c0", float_cb).is_ok());
        assert_eq!(api.len(), MAX_COMMANDS);
    }

    #[test]
    fn request_routing() {
        assert_eq!(
            route_request("GET /cmd?set_duty=20 HTTP/1.1"),
            Route::Command("set_duty=20")
        );
        assert_eq!(route_request("GET /events HTTP/1.1"), Route::Events);
        assert_eq!(route_request("GET /cmd HTTP/1.0"), Route::Command(""));
        assert_eq!(route_request("POST /cmd?a=1 HTTP/1.1"), Route::NotFound);
        assert_eq!(route_request("GET /index.html HTTP/1.1"), Route::NotFound);
        assert_eq!(route_request(""), Route::NotFound);
    }

    #[test]
    fn query_pair_splitting() {
        let pairs: std::vec::Vec<_> = query_pairs("set_duty=20&clear_shutdown&&x=").collect();
        assert_eq!(pairs, vec![("set_duty", "20"), ("clear_shutdown", ""), ("x", "")]);
    }

    #[test]
    fn sse_frame() {
        let mut out: String<64> = String::new();
        format_sse(&mut out, EVENT_HEARTBEAT, "OK").unwrap();
        assert_eq!(out.as_str(), "event: heartbeat\ndata: OK\n\n");
    }

    #[test]
    fn submit_skips_oversized_pairs() {
        let queue = CommandQueue::new();
        let bits = EventBits::new();
        let long = "x".repeat(CMD_ARG_LEN + 1);
        let query = format!("set_duty=20&set_frequency={}&clear_shutdown", long);
        let queued = embassy_futures::block_on(submit_commands(&query, &queue, &bits));
        assert_eq!(queued, 2);
        assert_eq!(bits.take(), EVT_CONFIG_CHANGED);
        assert_eq!(queue.try_receive().unwrap(), CommandRequest::new("set_duty", "20").unwrap());
        assert_eq!(queue.try_receive().unwrap().name.as_str(), "clear_shutdown");
        assert!(queue.try_receive().is_err());
    }

    #[test]
    fn command_request_limits() {
        assert!(CommandRequest::new("set_duty", "20").is_ok());
        let long = "x".repeat(CMD_ARG_LEN + 1);
        assert_eq!(CommandRequest::new("set_duty", &long), Err(ApiError::ArgTooLong));
    }
}
