use actix_web::{web, App, HttpResponse, HttpServer};
use clap::Parser;
use log::info;
use std::io;
use std::sync::{Mutex, PoisonError};

use mocap_hover::TelemetryRecord;

// the hover process pushes one record per tick here, plotting tools poll it

#[derive(Parser, Debug)]
#[command(name = "telemetry_server", about = "Latest-value telemetry relay", long_about = None)]
struct Args {
    #[arg(long, default_value = "127.0.0.1:8080")]
    bind: String,
}

struct AppState {
    latest: Mutex<TelemetryRecord>,
}

async fn set_telemetry(data: web::Json<TelemetryRecord>, app_data: web::Data<AppState>) -> HttpResponse {
    let mut latest = app_data.latest.lock().unwrap_or_else(PoisonError::into_inner);
    *latest = data.into_inner();
    HttpResponse::NoContent().finish()
}

async fn get_telemetry(app_data: web::Data<AppState>) -> HttpResponse {
    let latest = app_data.latest.lock().unwrap_or_else(PoisonError::into_inner);
    HttpResponse::Ok().json(&*latest)
}

#[actix_web::main]
async fn main() -> io::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let shared = web::Data::new(AppState {
        latest: Mutex::new(TelemetryRecord::default()),
    });

    info!("serving telemetry on http://{}/telemetry", args.bind);
    HttpServer::new(move || {
        App::new()
            .app_data(shared.clone())
            .route("/telemetry", web::get().to(get_telemetry))
            .route("/telemetry", web::post().to(set_telemetry))
    })
    .bind(args.bind)?
    .run()
    .await
}
