//! Serves a directory, or whatever a JSON configuration file describes.
//!
//! ```text
//! cargo run --example static_server -- ./public
//! cargo run --example static_server -- --config server.json
//! ```

use pipe_http::{Host, Location};
use pipe_web::{Server, ServerConfig};
use tracing::Level;

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().skip(1).collect();

    let builder = match args.as_slice() {
        [flag, path] if flag == "--config" => match ServerConfig::from_json_file(path) {
            Ok(config) => Server::builder().config(&config),
            Err(e) => {
                eprintln!("{e}");
                return;
            }
        },
        [root] => {
            let host = Host::builder("*", root.as_str()).location(Location::new("/").auto_index(true)).build();
            match host {
                Ok(host) => Server::builder().address("127.0.0.1:8080").host(host).log_level(Level::DEBUG),
                Err(e) => {
                    eprintln!("{e}");
                    return;
                }
            }
        }
        _ => {
            eprintln!("usage: static_server <document root> | --config <file>");
            return;
        }
    };

    match builder.build() {
        Ok(server) => server.start().await,
        Err(e) => eprintln!("{e}"),
    }
}
