//! # Reservation Desk
//!
//! The restaurant the simulated caller books with: eight tables, hourly
//! seatings from 5 PM to 11 PM, and an in-memory reservation book.
//!
//! ## Availability Rules:
//! - A table fits when its capacity covers the party and its location matches
//!   the seating preference ("Smoking" means outdoor, anything else indoor)
//! - A slot is taken when the book already holds a reservation for that table
//! - Some slots are also blocked deterministically to simulate a busy
//!   restaurant: a 32-bit string hash of date, time and table id, blocked when
//!   `|hash % 100| < 35`
//! - Bookings are accepted up to 90 days ahead of today (Philippine Time)
//!
//! ## Tools:
//! - `getRestaurantInfo`: static restaurant details
//! - `checkAvailability`: hours with at least one suitable free table
//! - `makeReservation`: books the first suitable free table

use crate::call::tools::ToolHandler;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{Duration, NaiveDate, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Mutex;
use tracing::info;

/// Days ahead of today a booking may be made for.
pub const BOOKING_HORIZON_DAYS: i64 = 90;

/// Seating hours, in the format the agent is told to use.
pub static HOURS: [&str; 7] = [
    "5:00 PM", "6:00 PM", "7:00 PM", "8:00 PM", "9:00 PM", "10:00 PM", "11:00 PM",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Location {
    Indoor,
    Outdoor,
}

impl Location {
    pub fn from_preference(preference: &str) -> Self {
        if preference == "Smoking" {
            Location::Outdoor
        } else {
            Location::Indoor
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            Location::Indoor => "indoor",
            Location::Outdoor => "outdoor",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct Table {
    pub id: &'static str,
    pub number: u32,
    pub capacity: u32,
    pub location: Location,
}

pub static TABLES: [Table; 8] = [
    Table { id: "t1", number: 1, capacity: 2, location: Location::Outdoor },
    Table { id: "t2", number: 2, capacity: 2, location: Location::Indoor },
    Table { id: "t3", number: 3, capacity: 4, location: Location::Outdoor },
    Table { id: "t4", number: 4, capacity: 4, location: Location::Indoor },
    Table { id: "t5", number: 5, capacity: 6, location: Location::Outdoor },
    Table { id: "t6", number: 6, capacity: 6, location: Location::Indoor },
    Table { id: "t7", number: 7, capacity: 8, location: Location::Outdoor },
    Table { id: "t8", number: 8, capacity: 8, location: Location::Indoor },
];

pub fn restaurant_info() -> Value {
    json!({
        "name": "Aristello",
        "cuisine": "Italian-French",
        "hours": "5:00 PM - 11:00 PM Daily",
        "address": "73 CLA Town Plaza, Binan, Pagsanjan, Laguna",
        "landmarks": "Beside Plaza Theatre",
        "directions": "Located in the main town plaza of Pagsanjan. From the National Highway, turn towards the municipal hall. We are located beside the historic Plaza Theatre.",
        "parking": "Valet parking available ($15)",
        "diningStyle": "Casual Dining"
    })
}

/// Whether a slot is blocked to simulate other bookings.
pub fn is_simulated_unavailable(date: &str, time: &str, table_id: &str) -> bool {
    let seed = format!("{}{}{}", date, time, table_id);
    let hash = seed.encode_utf16().fold(0i32, |hash, unit| {
        hash.wrapping_shl(5)
            .wrapping_sub(hash)
            .wrapping_add(unit as i32)
    });
    (hash % 100).abs() < 35
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Reservation {
    pub id: String,
    pub name: String,
    pub phone: String,
    pub guests: f64,
    pub date: String,
    pub time: String,
    pub seating_preference: String,
    pub table_id: String,
}

/// In-memory reservation book shared by every call on the reservation desk.
#[derive(Debug, Default)]
pub struct ReservationBook {
    reservations: Mutex<Vec<Reservation>>,
}

impl ReservationBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reservations(&self) -> Vec<Reservation> {
        self.reservations
            .lock()
            .map(|book| book.clone())
            .unwrap_or_default()
    }

    pub fn is_table_available(&self, date: &str, time: &str, table_id: &str) -> bool {
        let reserved = self
            .reservations
            .lock()
            .map(|book| {
                book.iter()
                    .any(|r| r.table_id == table_id && r.date == date && r.time == time)
            })
            .unwrap_or(true);
        !reserved && !is_simulated_unavailable(date, time, table_id)
    }

    /// Run one tool as of `today`.
    pub fn handle(&self, name: &str, args: &Value, today: NaiveDate) -> Result<Value> {
        if let Some(date) = args.get("date").and_then(Value::as_str) {
            if let Ok(requested) = NaiveDate::parse_from_str(date, "%Y-%m-%d") {
                if requested > today + Duration::days(BOOKING_HORIZON_DAYS) {
                    return Ok(json!({
                        "success": false,
                        "message": format!(
                            "Unfortunately we can only reserve up until {} days from today.",
                            BOOKING_HORIZON_DAYS
                        )
                    }));
                }
            }
        }

        match name {
            "getRestaurantInfo" => Ok(restaurant_info()),
            "checkAvailability" => self.check_availability(args),
            "makeReservation" => self.make_reservation(args),
            _ => Ok(json!({ "error": "Unknown function" })),
        }
    }

    fn check_availability(&self, args: &Value) -> Result<Value> {
        let date = required_str(args, "date")?;
        let guests = required_number(args, "guests")?;
        let location = Location::from_preference(required_str(args, "seatingPreference")?);

        let slots: Vec<&str> = HOURS
            .iter()
            .copied()
            .filter(|hour| {
                suitable_tables(guests, location).any(|t| self.is_table_available(date, hour, t.id))
            })
            .collect();

        if slots.is_empty() {
            return Ok(json!({
                "available": false,
                "message": format!(
                    "No {} tables available for {} guests on {}. Perhaps another day?",
                    location.as_str(),
                    display_number(guests),
                    date
                )
            }));
        }

        Ok(json!({
            "available": true,
            "options": format!("We have tables available at {}.", slots.join(", "))
        }))
    }

    fn make_reservation(&self, args: &Value) -> Result<Value> {
        let customer = required_str(args, "customerName")?;
        let guests = required_number(args, "guests")?;
        let date = required_str(args, "date")?;
        let time = required_str(args, "time")?;
        let preference = required_str(args, "seatingPreference")?;
        let phone = args.get("phone").and_then(Value::as_str).unwrap_or("N/A");
        let location = Location::from_preference(preference);

        let mut book = self
            .reservations
            .lock()
            .map_err(|_| anyhow!("Reservation book is unavailable"))?;

        let table = suitable_tables(guests, location).find(|t| {
            !book
                .iter()
                .any(|r| r.table_id == t.id && r.date == date && r.time == time)
                && !is_simulated_unavailable(date, time, t.id)
        });

        let Some(table) = table else {
            return Ok(json!({
                "success": false,
                "message": format!(
                    "Sorry, we have no tables available for {} guests with a {} preference at {} on {}.",
                    display_number(guests),
                    location.as_str(),
                    time,
                    date
                )
            }));
        };

        let reservation = Reservation {
            id: next_confirmation_id(&book),
            name: customer.to_string(),
            phone: phone.to_string(),
            guests,
            date: date.to_string(),
            time: time.to_string(),
            seating_preference: preference.to_string(),
            table_id: table.id.to_string(),
        };
        info!(
            confirmation = %reservation.id,
            table = table.number,
            date,
            time,
            "Reservation booked"
        );
        let confirmation = reservation.id.clone();
        book.push(reservation);

        Ok(json!({
            "success": true,
            "confirmationId": confirmation,
            "message": format!("Reservation confirmed for {} at table {}.", customer, table.number)
        }))
    }
}

#[async_trait]
impl ToolHandler for ReservationBook {
    async fn call(&self, name: &str, arguments: &Value) -> Result<Value> {
        self.handle(name, arguments, super::today_pht(Utc::now()))
    }
}

fn suitable_tables(guests: f64, location: Location) -> impl Iterator<Item = &'static Table> {
    TABLES
        .iter()
        .filter(move |t| t.capacity as f64 >= guests && t.location == location)
}

/// `res-<millis>`, bumped if another booking already used this millisecond.
fn next_confirmation_id(book: &[Reservation]) -> String {
    let mut millis = Utc::now().timestamp_millis();
    while book.iter().any(|r| r.id == format!("res-{}", millis)) {
        millis += 1;
    }
    format!("res-{}", millis)
}

fn required_str<'a>(args: &'a Value, key: &str) -> Result<&'a str> {
    args.get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow!("Missing required argument '{}'", key))
}

fn required_number(args: &Value, key: &str) -> Result<f64> {
    let value = args
        .get(key)
        .ok_or_else(|| anyhow!("Missing required argument '{}'", key))?;
    value
        .as_f64()
        .or_else(|| value.as_str().and_then(|s| s.trim().parse().ok()))
        .ok_or_else(|| anyhow!("Argument '{}' must be a number", key))
}

pub(crate) fn display_number(value: f64) -> String {
    if value.fract() == 0.0 {
        format!("{}", value as i64)
    } else {
        format!("{}", value)
    }
}
