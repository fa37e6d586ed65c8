//! Illustrates wiring `fastcgi-responder` into a standalone process: reading
//! a couple of environment-variable knobs, logging through `tracing`, and
//! running the application loop that consumes published requests.
//!
//! This binary is scaffolding, not part of the crate's public contract —
//! process startup, configuration, and the application logic it drives are
//! all out of scope for the library itself.

use std::env;
use std::net::TcpListener;

use fastcgi_responder::Responder;

fn main() -> std::io::Result<()> {
    tracing_subscriber::fmt::init();

    let thread_num: usize =
        env::var("FASTCGI_THREADS").ok().and_then(|v| v.parse().ok()).unwrap_or(4);

    let listener = match env::var("FASTCGI_LISTEN_ADDR") {
        Ok(addr) => TcpListener::bind(addr)?,
        // Conventionally FD 0 under `spawn-fcgi`/`mod_fcgid`: the web
        // server binds the socket and hands it to us already listening.
        #[cfg(unix)]
        Err(_) => unsafe { Responder::listener_from_inherited_fd()? },
        #[cfg(not(unix))]
        Err(_) => TcpListener::bind("127.0.0.1:9000")?,
    };

    let responder = Responder::new();
    responder.start(listener, thread_num)?;

    loop {
        let request = responder.pop_request_blocking();
        let body = format!(
            "Content-Type: text/plain\r\n\r\nhello from request {}\n",
            request.id()
        );
        request.stdout(body.as_bytes());
        request.end_stdout();
        request.reply(0);
    }
}
