use courier_chat::bus::CacheBus;
use courier_chat::config::Config;

#[rocket::main]
async fn main() {
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("❌ configuration error: {e}");
            std::process::exit(1);
        }
    };

    let bus = match CacheBus::connect(&config.bus_url).await {
        Ok(bus) => bus,
        Err(e) => {
            eprintln!("❌ cache/bus connection failed: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = courier_chat::build_rocket(config, bus).launch().await {
        eprintln!("❌ server failed: {e}");
        std::process::exit(1);
    }
}
