use std::env;
use std::process;
use std::sync::Arc;
use std::time::Duration;

use getopts::Options;
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn, LevelFilter};
use serde_json::json;
use simplelog::{ColorChoice, ConfigBuilder, TermLogger, TerminalMode};

use dnsreq::dns::context::DnsContext;
use dnsreq::dns::protocol::{DnsPacket, DnsQuestion};
use dnsreq::dns::request::{Request, RequestEvent};
use dnsreq::dns::transport::{ServerAddr, Transport};
use dnsreq::Settings;

const DEFAULT_SERVER: &str = "8.8.8.8";
const LOG_TARGET_MAIN: &str = "dnsreq::Main";

fn main() {
    let args: Vec<String> = env::args().collect();
    let program = args[0].clone();

    let mut opts = Options::new();
    opts.optflag("h", "help", "Print this help menu");
    opts.optopt("t", "type", "Record type to ask for, A by default", "TYPE");
    opts.optopt("s", "server", "Nameserver, like 8.8.8.8, [::1]:53 or tcp://1.1.1.1", "SERVER");
    opts.optflag("T", "tcp", "Query over TCP");
    opts.optopt("", "timeout", "Time to wait for the answer", "MILLIS");
    opts.optflag("n", "norecurse", "Do not ask the server to recurse");
    opts.optflag("p", "promote", "Decode records to their typed form");
    opts.optflag("j", "json", "Print the answer as JSON");
    opts.optflag("v", "verbose", "Show more debug messages");
    opts.optflag("d", "debug", "Show trace messages, more than debug");
    opts.optopt("c", "config", "Path to config file", "FILE");

    let opt_matches = match opts.parse(&args[1..]) {
        Ok(m) => m,
        Err(f) => {
            eprintln!("{}", f);
            process::exit(2);
        }
    };

    let brief = format!("Usage: {} [options] NAME", program);
    if opt_matches.opt_present("h") || opt_matches.free.len() != 1 {
        print!("{}", opts.usage(&brief));
        return;
    }

    let mut level = LevelFilter::Warn;
    if opt_matches.opt_present("v") {
        level = LevelFilter::Debug;
    }
    if opt_matches.opt_present("d") {
        level = LevelFilter::Trace;
    }
    let config = ConfigBuilder::new().set_time_level(LevelFilter::Off).build();
    let _ = TermLogger::init(level, config, TerminalMode::Stderr, ColorChoice::Auto);

    let settings = match opt_matches.opt_str("c") {
        None => Settings::default(),
        Some(path) => match Settings::load(&path) {
            Ok(settings) => settings,
            Err(e) => {
                error!(target: LOG_TARGET_MAIN, "Error loading {}: {}", &path, e);
                process::exit(2);
            }
        },
    };
    debug!(target: LOG_TARGET_MAIN, "Using settings: {:?}", &settings);

    let context = Arc::new(DnsContext::new(settings));
    if opt_matches.opt_present("p") {
        context.set_promote(true);
    }

    let qtype = opt_matches.opt_str("t").unwrap_or_else(|| String::from("A"));
    let question = match DnsQuestion::parse(&opt_matches.free[0], &qtype) {
        Ok(question) => question,
        Err(e) => fail(&format!("Bad question: {}", e), 2),
    };

    let server = opt_matches.opt_str("s").unwrap_or_else(|| String::from(DEFAULT_SERVER));
    let mut server: ServerAddr = match server.parse() {
        Ok(server) => server,
        Err(e) => fail(&format!("Bad server {}: {}", server, e), 2),
    };
    if opt_matches.opt_present("T") {
        server = server.with_transport(Transport::Tcp);
    }

    let timeout = match opt_matches.opt_str("timeout") {
        None => context.default_timeout(),
        Some(millis) => match millis.parse::<u64>() {
            Ok(millis) => Duration::from_millis(millis),
            Err(_) => fail(&format!("Bad timeout: {}", millis), 2),
        },
    };

    let mut request = match Request::new(Arc::clone(&context), question, server, timeout) {
        Ok(request) => request,
        Err(e) => fail(&e.to_string(), 2),
    };
    if opt_matches.opt_present("n") {
        request.set_recursion_desired(false);
    }

    let events = match request.send() {
        Ok(events) => events,
        Err(e) => fail(&e.to_string(), 1),
    };

    let mut code = 1;
    for event in events.iter() {
        match event {
            RequestEvent::Message(Ok(packet)) => {
                print_packet(&packet, opt_matches.opt_present("j"));
                code = 0;
            }
            RequestEvent::Message(Err(e)) => error!(target: LOG_TARGET_MAIN, "Query failed: {}", e),
            RequestEvent::Timeout => error!(target: LOG_TARGET_MAIN, "No answer from {} in {} ms", server, timeout.as_millis()),
            RequestEvent::End => break,
        }
    }

    context.stop();
    process::exit(code);
}

fn print_packet(packet: &DnsPacket, as_json: bool) {
    if !as_json {
        println!("{}", packet);
        return;
    }

    let value = json!({
        "id": packet.header.id,
        "rcode": format!("{:?}", packet.header.rescode),
        "truncated": packet.header.truncated_message,
        "questions": packet.questions,
        "answers": packet.answers,
        "authorities": packet.authorities,
        "additional": packet.resources,
    });
    match serde_json::to_string_pretty(&value) {
        Ok(text) => println!("{}", text),
        Err(e) => error!(target: LOG_TARGET_MAIN, "Cannot serialize answer: {}", e),
    }
}

fn fail(message: &str, code: i32) -> ! {
    eprintln!("{}", message);
    process::exit(code);
}
