mod config;
mod events;
mod server;
mod tui;

use std::io;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use anyhow::Result;
use clap::Parser;
use crossterm::event::{self, Event, KeyCode, KeyEventKind};
use crossterm::terminal::{self, EnterAlternateScreen, LeaveAlternateScreen};
use crossterm::{cursor, execute};
use ratatui::Terminal;
use ratatui::backend::CrosstermBackend;

use config::{DEFAULT_DISCOVERY_PORT, DEFAULT_PORT, ServerConfig};
use events::ServerEvent;
use server::EchoServer;
use tui::TuiState;

#[derive(Parser)]
#[command(name = "streamnet-server")]
#[command(about = "Stream echo server with LAN discovery")]
struct Args {
    #[arg(short, long, default_value = "0.0.0.0")]
    bind: String,

    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,

    #[arg(short, long, default_value_t = streamnet::config::DEFAULT_MAX_STREAMS)]
    max_streams: usize,

    #[arg(long, default_value_t = 10, help = "Longest a single pass may block, in ms")]
    tick_ms: u64,

    #[arg(long, default_value_t = DEFAULT_DISCOVERY_PORT, help = "UDP port answering discovery requests")]
    discovery_port: u16,

    #[arg(long, help = "Do not open the discovery socket")]
    no_discovery: bool,

    #[arg(long, help = "Allow IPv6 addresses when resolving")]
    ipv6: bool,

    #[arg(long, default_value_t = 1024 * 1024, help = "Per-stream outbound cap in bytes (0 = unbounded)")]
    max_outbound: usize,

    #[arg(long)]
    headless: bool,

    #[arg(long, default_value_t = 0, help = "Log the stream table every N seconds in headless mode")]
    status_interval: u64,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let config = ServerConfig {
        tick_ms: args.tick_ms,
        max_streams: args.max_streams,
        max_outbound_bytes: (args.max_outbound > 0).then_some(args.max_outbound),
        ipv4_only: !args.ipv6,
        discovery_port: (!args.no_discovery).then_some(args.discovery_port),
    };

    if args.headless {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    }

    let mut server = EchoServer::new(&args.bind, args.port, config)?;

    if args.headless {
        run_headless(&mut server, args.status_interval);
    } else {
        run_with_tui(&mut server)?;
    }

    Ok(())
}

fn run_headless(server: &mut EchoServer, status_interval: u64) {
    if let Some(addr) = server.local_addr() {
        log::info!("Server started on {}", addr);
    }
    if let Some(addr) = server.discovery_addr() {
        log::info!("Answering discovery on {}", addr);
    }
    server.announce();

    if status_interval == 0 {
        server.run();
    } else {
        let running = server.running();
        let interval = Duration::from_secs(status_interval);
        let mut last_status = Instant::now();

        while running.load(Ordering::SeqCst) {
            server.tick_once();
            server.drain_events();
            if last_status.elapsed() >= interval {
                server.log_streams();
                last_status = Instant::now();
            }
        }
        server.shutdown_connections();
    }

    log::info!("Server shutting down");
}

fn run_with_tui(server: &mut EchoServer) -> io::Result<()> {
    terminal::enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen, cursor::Hide)?;

    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let running = server.running();
    let mut tui_state = TuiState::new();

    match server.local_addr() {
        Some(addr) => tui_state.log_info(format!("Server started on {}", addr)),
        None => tui_state.log_info("Server started for loopback connections"),
    }
    if let Some(addr) = server.discovery_addr() {
        tui_state.log_info(format!("Answering discovery on {}", addr));
    }

    while running.load(Ordering::SeqCst) {
        server.tick_once();

        for event in server.drain_events() {
            match event {
                ServerEvent::StreamOpened { stream, peer } => {
                    tui_state.log_info(format!("Stream {} opened from {}", stream, peer));
                }
                ServerEvent::StreamClosed { stream, reason } => {
                    tui_state.log_info(format!("Stream {} {}", stream, reason.as_str()));
                }
                ServerEvent::DiscoveryPing { from } => {
                    tui_state.log_info(format!("Discovery request from {}", from));
                }
                ServerEvent::ProbeEchoed { bytes } => {
                    tui_state.log_info(format!("Loopback probe echoed {} bytes", bytes));
                }
                ServerEvent::Error { message } => {
                    tui_state.log_error(message);
                }
            }
        }

        if let Some(index) = tui_state.take_pending_kick() {
            server.kick(index);
        }

        if event::poll(Duration::from_millis(1))? {
            if let Event::Key(key) = event::read()? {
                if key.kind == KeyEventKind::Press {
                    let streams = server.stream_infos();
                    match key.code {
                        KeyCode::Char('q') | KeyCode::Esc => {
                            running.store(false, Ordering::SeqCst);
                        }
                        KeyCode::PageUp => tui_state.scroll_up(),
                        KeyCode::PageDown => tui_state.scroll_down(),
                        KeyCode::End => tui_state.scroll_to_bottom(),
                        KeyCode::Up => tui_state.select_prev(streams.len()),
                        KeyCode::Down => tui_state.select_next(streams.len()),
                        KeyCode::Char('k') | KeyCode::Char('K') => {
                            tui_state.request_kick(&streams);
                        }
                        KeyCode::Char('p') => server.probe_loopback(),
                        KeyCode::Char('b') => {
                            if server.discovery_addr().is_some() {
                                server.announce();
                                tui_state.log_info("Announced on the discovery port");
                            } else {
                                tui_state.log_warn("Discovery is disabled");
                            }
                        }
                        _ => {}
                    }
                }
            }
        }

        let stats = server.stats();
        let streams = server.stream_infos();
        terminal.draw(|frame| {
            tui::render(frame, &tui_state, &stats, &streams);
        })?;
    }

    tui_state.log_info("Shutting down...");
    server.shutdown_connections();

    terminal::disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen, cursor::Show)?;

    Ok(())
}
