use crate::desk::{scenarios_for, Desk};
use crate::{error::AppError, state::AppState};
use actix_web::{web, HttpResponse};
use serde::Deserialize;
use serde_json::json;

#[derive(Debug, Deserialize)]
pub struct ScenarioQuery {
    pub desk: Option<String>,
}

fn parse_desk(name: &str) -> Result<Desk, AppError> {
    match name {
        "reservations" => Ok(Desk::Reservations),
        "room_service" => Ok(Desk::RoomService),
        other => Err(AppError::BadRequest(format!(
            "Unknown desk '{}', expected 'reservations' or 'room_service'",
            other
        ))),
    }
}

/// `GET /api/v1/scenarios[?desk=reservations|room_service]`
pub async fn list_scenarios(query: web::Query<ScenarioQuery>) -> Result<HttpResponse, AppError> {
    let desks = match query.desk.as_deref() {
        Some(name) => vec![parse_desk(name)?],
        None => vec![Desk::Reservations, Desk::RoomService],
    };

    let listing: Vec<_> = desks
        .into_iter()
        .map(|desk| {
            json!({
                "desk": desk,
                "title": desk.title(),
                "metrics": desk.metric_labels(),
                "scenarios": scenarios_for(desk).collect::<Vec<_>>()
            })
        })
        .collect();

    Ok(HttpResponse::Ok().json(json!({ "desks": listing })))
}

pub async fn list_reservations(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let reservations = state.desks.reservations.reservations();
    Ok(HttpResponse::Ok().json(json!({
        "count": reservations.len(),
        "reservations": reservations
    })))
}

pub async fn list_orders(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let orders = state.desks.room_service.orders();
    Ok(HttpResponse::Ok().json(json!({
        "count": orders.len(),
        "orders": orders
    })))
}
