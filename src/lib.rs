pub mod auth;
pub mod bus;
pub mod chats;
pub mod config;
pub mod db;
pub mod delivery;
pub mod error;
pub mod events;
pub mod gateway;
pub mod messages;
pub mod models;
pub mod presence;
pub mod rate_limit;
pub mod routes;
pub mod sanitize;
pub mod sessions;

use auth::TokenSigner;
use bus::CacheBus;
use chats::ChatService;
use config::Config;
use db::Db;
use delivery::DeliveryEngine;
use gateway::{Gateway, TypingTracker};
use messages::MessageService;
use presence::PresenceTracker;
use sessions::SessionRegistry;

/// Assembles the application: store, cache/bus, services, gateway, and the
/// background workers started at liftoff. The bus is passed in pre-built so
/// the caller controls the backend (Redis in production, in-process for a
/// single node and in tests).
pub fn build_rocket(config: Config, bus: CacheBus) -> rocket::Rocket<rocket::Build> {
    config.validate().expect("invalid configuration");

    // Ensure data directory exists
    if let Some(parent) = std::path::Path::new(&config.database_path).parent() {
        std::fs::create_dir_all(parent).ok();
    }

    let db = Db::open(
        &config.database_path,
        &config.reader_database_path,
        &config.search_tokenizer,
    );
    let signer = TokenSigner::new(&config);
    let registry = SessionRegistry::new(db.clone(), bus.clone(), signer, config.refresh_ttl_secs);
    let presence = PresenceTracker::new(db.clone(), bus.clone(), registry.clone());
    let messages = MessageService::new(db.clone(), bus.clone(), config.sends_per_sec);
    let chats = ChatService::new(db.clone(), bus.clone(), messages.clone());
    let engine = DeliveryEngine::new(db.clone(), bus.clone(), presence.clone());
    let typing = TypingTracker::default();
    let gateway = Gateway::new(
        db.clone(),
        bus.clone(),
        registry.clone(),
        presence.clone(),
        messages.clone(),
        engine.clone(),
        typing.clone(),
    );

    let cors = rocket_cors::CorsOptions::default()
        .allowed_origins(rocket_cors::AllowedOrigins::some_exact(&[
            config.allowed_origin.as_str(),
        ]))
        .to_cors()
        .expect("Failed to create CORS");

    // Socket shutdown notice goes out, then in-flight sends get 5s to land.
    let figment = rocket::Config::figment().merge(("shutdown.grace", 5));

    let worker_engine = engine.clone();
    let worker_bus = bus.clone();
    let worker_typing = typing.clone();

    rocket::custom(figment)
        .manage(config)
        .manage(db)
        .manage(bus)
        .manage(registry)
        .manage(presence)
        .manage(messages)
        .manage(chats)
        .manage(engine)
        .manage(gateway)
        .attach(cors)
        .register(
            "/",
            rocket::catchers![
                routes::bad_request,
                routes::unauthorized,
                routes::forbidden,
                routes::not_found,
                routes::conflict,
                routes::payload_too_large,
                routes::unprocessable,
                routes::too_many_requests,
                routes::internal_error,
            ],
        )
        .mount(
            "/",
            rocket::routes![
                routes::health,
                routes::register,
                routes::login,
                routes::refresh,
                routes::logout,
                routes::get_me,
                routes::update_me,
                routes::search_users,
                routes::get_user,
                routes::list_chats,
                routes::create_direct_chat,
                routes::create_group_chat,
                routes::get_chat,
                routes::update_chat,
                routes::delete_chat,
                routes::list_chat_participants,
                routes::add_chat_participants,
                routes::remove_chat_participant,
                routes::list_chat_messages,
                routes::send_chat_message,
                routes::mark_chat_read,
                routes::search_messages,
                routes::get_message,
                routes::edit_message,
                routes::delete_message,
                routes::get_edit_history,
                routes::get_reactions,
                routes::add_reaction,
                routes::remove_reaction,
                routes::mark_message_read,
                routes::socket_handler,
                routes::event_stream,
            ],
        )
        .attach(rocket::fairing::AdHoc::on_liftoff(
            "Delivery Engine",
            move |_rocket| {
                Box::pin(async move {
                    worker_engine.spawn();
                })
            },
        ))
        .attach(rocket::fairing::AdHoc::on_liftoff(
            "Presence & Typing Sweeps",
            move |_rocket| {
                Box::pin(async move {
                    presence::spawn_presence_pruner(worker_bus.clone());
                    gateway::spawn_typing_sweeper(worker_bus, worker_typing);
                    println!("🧹 presence and typing sweepers started");
                })
            },
        ))
}
