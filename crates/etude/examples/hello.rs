// examples/hello.rs
//
// ETUDE_URLS=http://0.0.0.0:8080 RUST_LOG=etude=debug cargo run --example hello
use std::sync::mpsc;

use etude::{Application, BoxError, Engine, EngineConfig, Exchange, ServiceContext};

struct Hello;

#[etude::async_trait(?Send)]
impl Application for Hello {
    async fn call(&self, exchange: &mut Exchange<'_>) -> Result<(), BoxError> {
        let path = exchange.path().to_owned();
        match path.as_str() {
            "/plaintext" => {
                let headers = exchange.response_headers_mut()?;
                headers.insert("Content-Type", "text/plain; charset=UTF-8");
                headers.insert("Content-Length", "13");
                exchange.write(b"Hello, World!").await?;
            }
            "/echo" => {
                let body = exchange.read_to_end().await?;
                exchange
                    .response_headers_mut()?
                    .insert("Content-Length", body.len().to_string());
                exchange.write(&body).await?;
            }
            "/stream" => {
                // No Content-Length: HTTP/1.1 clients get chunks.
                for i in 0..3 {
                    exchange.write(format!("part {i}\n").as_bytes()).await?;
                    exchange.flush().await?;
                }
            }
            _ => exchange.set_status(404)?,
        }
        Ok(())
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    etude::logging::init_logging();

    let config = EngineConfig::from_env()?;
    let ctx = ServiceContext::builder(Hello).config(&config).build()?;

    let mut engine = Engine::new(ctx);
    engine.start(config.thread_count)?;

    let mut servers = Vec::with_capacity(config.urls.len());
    for url in &config.urls {
        let server = engine.create_server(url)?;
        tracing::info!("listening on http://{}", server.local_addr());
        servers.push(server);
    }

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })?;
    let _ = rx.recv();

    tracing::info!("Received SIGINT. Initiating graceful shutdown...");
    drop(servers);
    engine.stop(config.shutdown_timeout())?;
    Ok(())
}
