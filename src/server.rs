//! Web interface: wake machines from a browser and watch them come up.

use std::io::{self, Read};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use lazy_static::lazy_static;
use log::{error, info, warn};
use percent_encoding::{percent_decode_str, utf8_percent_encode, NON_ALPHANUMERIC};
use prometheus::{register_int_counter, register_int_counter_vec, IntCounter, IntCounterVec};
use rouille::{input, post_input, router, try_or_400, Request, Response, ResponseBody};

use crate::config::Config;
use crate::ping::IcmpProber;
use crate::status::{poll_all, PROBE_TIMEOUT};
use crate::wol::{HardwareAddr, MagicPacket, WOL_PORT};

/// Delay between pushes on the status event stream.
const STATUS_INTERVAL: Duration = Duration::from_secs(5);

const FLASH_COOKIE: &str = "flash";

lazy_static! {
    static ref WAKE_REQUESTS: IntCounterVec = register_int_counter_vec!(
        "wolctl_wake_requests_total",
        "Wake requests handled by the web interface, by outcome.",
        &["outcome"]
    )
    .unwrap();
    static ref STATUS_CYCLES: IntCounter = register_int_counter!(
        "wolctl_status_poll_cycles_total",
        "Completed reachability poll cycles."
    )
    .unwrap();
}

/// Runs the web interface until the process exits.
pub fn run(config: Config) -> ! {
    let listen = config.server.listen.clone();
    let prober = Arc::new(IcmpProber::new(PROBE_TIMEOUT, config.ping.privileged));
    let config = Arc::new(config);
    info!("listening on {}", listen);
    rouille::start_server(listen, move |request| {
        let response = handle(request, &config, &prober);
        info!(
            "{request} {status}",
            request = request.raw_url(),
            status = response.status_code,
        );
        response
    })
}

fn handle(request: &Request, config: &Arc<Config>, prober: &Arc<IcmpProber>) -> Response {
    if let Some(denied) = check_auth(request, config) {
        return denied;
    }
    router!(request,
        (GET) (/) => { index(request, config) },
        (POST) (/wake) => { wake(request, config) },
        (GET) (/status) => { status_stream(config.clone(), prober.clone()) },
        (GET) (/varz) => { varz() },
        _ => Response::empty_404()
    )
}

fn check_auth(request: &Request, config: &Config) -> Option<Response> {
    let password = config.server.password.as_deref()?;
    if let Some(auth) = input::basic_http_auth(request) {
        if auth.password == password {
            return None;
        }
    }
    Some(
        Response::text("Unauthorized")
            .with_status_code(401)
            .with_additional_header("WWW-Authenticate", "Basic realm=\"wolctl\""),
    )
}

fn index(request: &Request, config: &Config) -> Response {
    let rows: String = config
        .machines
        .iter()
        .map(|machine| {
            format!(
                concat!(
                    "<tr><td>{name}</td><td><code>{mac}</code></td>",
                    "<td class=\"status\" id=\"status-{name}\">unknown</td>",
                    "<td><form method=\"post\" action=\"/wake\">",
                    "<input type=\"hidden\" name=\"name\" value=\"{name}\">",
                    "<button type=\"submit\">Wake</button></form></td></tr>"
                ),
                name = machine.name,
                mac = machine.mac,
            )
        })
        .collect();
    let flash = flash_message(request);
    let banner = match flash.as_deref() {
        Some(message) => format!("<p class=\"flash\">{}</p>", message),
        None => String::new(),
    };
    let page = include_str!("index.html")
        .replace("<!--ROWS-->", &rows)
        .replace("<!--FLASH-->", &banner);
    let response = Response::html(page);
    match flash {
        // Consume the message so a reload does not repeat it.
        Some(_) => response.with_additional_header(
            "Set-Cookie",
            format!("{}=; Path=/; Max-Age=0", FLASH_COOKIE),
        ),
        None => response,
    }
}

fn flash_message(request: &Request) -> Option<String> {
    input::cookies(request)
        .find(|&(name, _)| name == FLASH_COOKIE)
        .map(|(_, value)| percent_decode_str(value).decode_utf8_lossy().into_owned())
}

fn wake(request: &Request, config: &Config) -> Response {
    let data = try_or_400!(post_input!(request, { name: String }));
    let machine = match config.machine(&data.name) {
        Some(machine) => machine,
        None => return Response::text("machine not found").with_status_code(400),
    };
    let mac: HardwareAddr = match machine.mac.parse() {
        Ok(mac) => mac,
        Err(err) => {
            return Response::text(format!("bad MAC for {}: {}", machine.name, err))
                .with_status_code(400)
        }
    };

    info!("sending magic packet to {}", mac);
    let packet = MagicPacket::new(mac);
    if let Some(ip) = machine.ip.as_deref() {
        // Wake over WAN is best effort; the broadcast below is the
        // delivery that decides the response.
        let target = format!("{}:{}", ip, WOL_PORT);
        info!("sending unicast packet to {}", target);
        if let Err(err) = packet.send(&target) {
            warn!("unicast send to {} failed: {}", target, err);
        }
    }
    if let Err(err) = packet.broadcast() {
        error!("broadcast send failed: {}", err);
        WAKE_REQUESTS.with_label_values(&["error"]).inc();
        return Response::text(err.to_string()).with_status_code(500);
    }
    WAKE_REQUESTS.with_label_values(&["ok"]).inc();

    let message = format!(
        "Wake-up signal sent to {}. The machine should come up shortly.",
        machine.name
    );
    Response::redirect_303("/").with_additional_header(
        "Set-Cookie",
        format!(
            "{}={}; Path=/",
            FLASH_COOKIE,
            utf8_percent_encode(&message, NON_ALPHANUMERIC)
        ),
    )
}

fn status_stream(config: Arc<Config>, prober: Arc<IcmpProber>) -> Response {
    Response {
        status_code: 200,
        headers: vec![
            ("Content-Type".into(), "text/event-stream".into()),
            ("Cache-Control".into(), "no-cache".into()),
        ],
        data: ResponseBody::from_reader(StatusEvents::new(config, prober)),
        upgrade: None,
    }
}

fn varz() -> Response {
    let metrics = prometheus::gather();
    let encoder = prometheus::TextEncoder::new();
    match encoder.encode_to_string(&metrics) {
        Ok(text) => Response::text(text),
        Err(err) => Response::text(err.to_string()).with_status_code(500),
    }
}

/// Blocking reader producing one `data:` frame per poll cycle.
///
/// rouille drops the reader once the client goes away, which ends the
/// polling loop with it.
struct StatusEvents {
    config: Arc<Config>,
    prober: Arc<IcmpProber>,
    pending: Vec<u8>,
    first: bool,
}

impl StatusEvents {
    fn new(config: Arc<Config>, prober: Arc<IcmpProber>) -> Self {
        Self {
            config,
            prober,
            pending: Vec::new(),
            first: true,
        }
    }
}

impl Read for StatusEvents {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pending.is_empty() {
            if self.first {
                self.first = false;
            } else {
                thread::sleep(STATUS_INTERVAL);
            }
            let statuses = poll_all(&self.config.machines, &*self.prober);
            STATUS_CYCLES.inc();
            let payload = serde_json::to_string(&statuses)?;
            self.pending = format!("data: {}\n\n", payload).into_bytes();
        }
        let len = buf.len().min(self.pending.len());
        buf[..len].copy_from_slice(&self.pending[..len]);
        self.pending.drain(..len);
        Ok(len)
    }
}
