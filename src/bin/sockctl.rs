//! `sockctl`: management CLI client for the SOCKSv5 proxy's UDP management
//! protocol (SPEC_FULL.md §4.10). Grounded in `original_source/src/client.c`:
//! sends a single command read from argv, or — with none given — starts an
//! interactive `mgmt>` prompt reading lines from stdin until `quit`/`exit`.

use std::io::{self, BufRead, Write};
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::time::Duration;

use clap::Parser;
use socket2::{Domain, Socket, Type};

const RECV_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Parser, Debug)]
#[command(name = "sockctl", about = "Management CLI for the SOCKSv5 proxy")]
struct Args {
    /// Management server address.
    #[arg(short = 'L', long = "addr", default_value = "127.0.0.1")]
    addr: String,

    /// Management server port.
    #[arg(short = 'P', long = "port", default_value_t = 8080)]
    port: u16,

    /// Command and arguments to send. If omitted, starts an interactive
    /// prompt instead.
    #[arg(trailing_var_arg = true)]
    command: Vec<String>,
}

fn connect(addr: &str, port: u16) -> io::Result<UdpSocket> {
    let target: SocketAddr = (addr, port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "address resolved to no candidates"))?;

    let domain = if target.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
    let socket = Socket::new(domain, Type::DGRAM, None)?;
    socket.set_read_timeout(Some(RECV_TIMEOUT))?;
    socket.connect(&target.into())?;
    Ok(socket.into())
}

fn send_command(socket: &UdpSocket, cmd: &str) {
    if let Err(e) = socket.send(cmd.as_bytes()) {
        eprintln!("send error: {e}");
        return;
    }
    let mut buf = [0u8; 4096];
    match socket.recv(&mut buf) {
        Ok(n) => print!("{}", String::from_utf8_lossy(&buf[..n])),
        Err(e) if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::TimedOut => {
            eprintln!("timeout waiting for response");
        }
        Err(e) => eprintln!("recv error: {e}"),
    }
}

fn main() {
    let args = Args::parse();

    let socket = match connect(&args.addr, args.port) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("failed to reach management server at {}:{}: {e}", args.addr, args.port);
            std::process::exit(1);
        }
    };

    if !args.command.is_empty() {
        send_command(&socket, &args.command.join(" "));
        return;
    }

    println!("Connected to {}:{}", args.addr, args.port);
    println!("Type 'help' for commands, 'exit' or 'quit' to quit.\n");

    let stdin = io::stdin();
    loop {
        print!("mgmt> ");
        if io::stdout().flush().is_err() {
            break;
        }
        let mut line = String::new();
        match stdin.lock().read_line(&mut line) {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if matches!(line.to_ascii_lowercase().as_str(), "quit" | "exit" | "q") {
            break;
        }
        send_command(&socket, line);
    }
}
