//! # Room Service Desk
//!
//! Breakfast menu lookups and order placement for the hotel guest persona.
//! Orders accumulate in an in-memory ledger for the lifetime of the server.

use crate::call::tools::ToolHandler;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Mutex;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MenuItem {
    pub id: &'static str,
    pub name: &'static str,
    pub price: f64,
    pub category: &'static str,
    pub is_gluten_free: bool,
    pub description: &'static str,
}

pub static MENU: [MenuItem; 8] = [
    MenuItem { id: "m1", name: "Gluten-Free Pancakes", price: 14.99, category: "Appetizers", is_gluten_free: true, description: "Fluffy pancakes for a gluten-free start" },
    MenuItem { id: "m2", name: "Avocado Toast", price: 12.50, category: "Appetizers", is_gluten_free: false, description: "Fresh avocado on toasted sourdough" },
    MenuItem { id: "m3", name: "Avocado Toast (GF)", price: 13.50, category: "Appetizers", is_gluten_free: true, description: "Fresh avocado on toasted gluten-free bread" },
    MenuItem { id: "m4", name: "Omelet Station", price: 16.00, category: "Main Courses", is_gluten_free: false, description: "Build your own omelet" },
    MenuItem { id: "m5", name: "Steak & Eggs", price: 24.00, category: "Main Courses", is_gluten_free: false, description: "A hearty classic breakfast" },
    MenuItem { id: "m6", name: "Fruit Platter", price: 9.99, category: "Desserts", is_gluten_free: false, description: "A selection of fresh seasonal fruits" },
    MenuItem { id: "m7", name: "Orange Juice", price: 4.50, category: "Beverages", is_gluten_free: false, description: "Freshly squeezed orange juice" },
    MenuItem { id: "m8", name: "Coffee", price: 3.50, category: "Beverages", is_gluten_free: false, description: "Freshly brewed coffee" },
];

pub fn find_menu_item(name: &str) -> Option<&'static MenuItem> {
    MENU.iter().find(|item| item.name.to_lowercase() == name.to_lowercase())
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderLine {
    pub item_id: String,
    pub name: String,
    pub price: f64,
    pub quantity: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomServiceOrder {
    pub confirmation_number: String,
    pub room_number: f64,
    pub lines: Vec<OrderLine>,
    pub total: f64,
}

#[derive(Debug, Default)]
pub struct OrderLedger {
    orders: Mutex<Vec<RoomServiceOrder>>,
}

impl OrderLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn orders(&self) -> Vec<RoomServiceOrder> {
        self.orders
            .lock()
            .map(|orders| orders.clone())
            .unwrap_or_default()
    }

    pub fn handle(&self, name: &str, args: &Value) -> Result<Value> {
        match name {
            "getMenuItems" => Ok(menu_items(args)),
            "placeOrder" => self.place_order(args),
            _ => Ok(json!({ "error": "Unknown function" })),
        }
    }

    fn place_order(&self, args: &Value) -> Result<Value> {
        let room_number = args
            .get("roomNumber")
            .and_then(|v| v.as_f64().or_else(|| v.as_str().and_then(|s| s.trim().parse().ok())))
            .ok_or_else(|| anyhow!("Missing required argument 'roomNumber'"))?;
        let requested = args
            .get("items")
            .and_then(Value::as_array)
            .ok_or_else(|| anyhow!("Missing required argument 'items'"))?;

        let mut lines = Vec::new();
        let mut not_found = Vec::new();
        for entry in requested {
            let item_name = entry.get("itemName").and_then(Value::as_str).unwrap_or_default();
            let quantity = entry.get("quantity").and_then(Value::as_f64).unwrap_or(1.0);
            match find_menu_item(item_name) {
                Some(item) => lines.push(OrderLine {
                    item_id: item.id.to_string(),
                    name: item.name.to_string(),
                    price: item.price,
                    quantity,
                }),
                None => not_found.push(item_name.to_string()),
            }
        }

        if !not_found.is_empty() {
            warn!(room = room_number, items = ?not_found, "Order referenced unknown menu items");
        }

        let total = round_cents(lines.iter().map(|l| l.price * l.quantity).sum());
        let mut orders = self
            .orders
            .lock()
            .map_err(|_| anyhow!("Order ledger is unavailable"))?;

        let mut millis = Utc::now().timestamp_millis();
        while orders
            .iter()
            .any(|o| o.confirmation_number == format!("order-{}", millis))
        {
            millis += 1;
        }
        let order = RoomServiceOrder {
            confirmation_number: format!("order-{}", millis),
            room_number,
            lines,
            total,
        };
        info!(
            confirmation = %order.confirmation_number,
            room = room_number,
            lines = order.lines.len(),
            total,
            "Room service order placed"
        );

        let mut result = json!({
            "success": true,
            "confirmationNumber": order.confirmation_number,
            "totalItems": order.lines.len(),
            "total": total
        });
        if !not_found.is_empty() {
            result["notFound"] = json!(not_found);
        }
        orders.push(order);
        Ok(result)
    }
}

#[async_trait]
impl ToolHandler for OrderLedger {
    async fn call(&self, name: &str, arguments: &Value) -> Result<Value> {
        self.handle(name, arguments)
    }
}

fn menu_items(args: &Value) -> Value {
    let category = args
        .get("category")
        .and_then(Value::as_str)
        .filter(|c| !c.is_empty());
    let gluten_free_only = args.get("isGlutenFree").and_then(Value::as_bool) == Some(true);

    let items: Vec<Value> = MENU
        .iter()
        .filter(|item| category.map_or(true, |c| item.category == c))
        .filter(|item| !gluten_free_only || item.is_gluten_free)
        .map(|item| json!({ "name": item.name, "price": item.price, "description": item.description }))
        .collect();

    json!({ "items": items })
}

fn round_cents(amount: f64) -> f64 {
    (amount * 100.0).round() / 100.0
}
