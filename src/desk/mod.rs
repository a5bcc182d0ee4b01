//! # Practice Desks
//!
//! The two hospitality desks a student can practice on, the scenario catalog
//! for each, and the call plans handed to the session controller.
//!
//! ## Key Components:
//! - **Desk**: title, metric labels, agent persona prompt and tool declarations
//! - **Scenario**: a caller persona with an opening line
//! - **Desks**: the shared desk state (reservation book, order ledger) and
//!   the factory for per-call plans

pub mod reservations;
pub mod room_service;

use crate::call::tools::ToolHandler;
use crate::call::CallPlan;
use chrono::{DateTime, FixedOffset, NaiveDate, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;

pub use reservations::ReservationBook;
pub use room_service::OrderLedger;

const RESERVATION_SYSTEM_PROMPT: &str = "You are a customer calling the restaurant 'Aristello' to make a reservation. Your goal is to interact naturally with the student, who is playing the role of the receptionist. Start the conversation with your initial request from the scenario. If the scenario involves asking for information, state your questions clearly. For booking scenarios, wait for the receptionist to ask you questions, and then provide the details needed (party size, date, time). Be conversational and cooperative. Today's date is {current_date_pht}. You MUST use this as the current date for all interactions. All times are in Philippine Time (PHT). Do not request a specific table number, but you can express a preference for a location like 'indoor', 'outdoor', or a quality like 'quiet'. Use the provided functions to get restaurant information and check availability. Do not mention that you are an AI. SPECIAL INSTRUCTION: After your main goal (like making a reservation) is confirmed by the student, or if the student asks if there is anything else they can help you with, you MUST ask one or two follow-up questions about the restaurant. Choose from: \"Do you have parking available?\", \"What are your hours of operation?\", \"What is the dining style?\", \"How do I get there? What are some landmarks?\", \"What type of cuisine is it?\", or \"Could you tell me a bit about your menu?\".";

const ROOM_SERVICE_SYSTEM_PROMPT: &str = "You are a hotel guest calling room service. Your goal is to place an order, ask questions about the menu, and interact with the student, who is playing the role of the room service attendant. Use the provided functions to get menu information and place your order. Do not mention that you are an AI. Be polite but clear about your needs.";

/// Philippine Time, UTC+8.
const PHT_OFFSET_SECS: i32 = 8 * 3600;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Desk {
    Reservations,
    RoomService,
}

impl Desk {
    pub fn title(&self) -> &'static str {
        match self {
            Desk::Reservations => "RESERVATION CALL SIMULATOR",
            Desk::RoomService => "ROOM SERVICE CALL SIMULATOR",
        }
    }

    pub fn metric_labels(&self) -> Vec<String> {
        let labels: &[&str] = match self {
            Desk::Reservations => &["Politeness", "Efficiency", "Accuracy"],
            Desk::RoomService => &["Accuracy", "Upselling", "Resolution"],
        };
        labels.iter().map(|l| l.to_string()).collect()
    }

    /// Persona prompt for the agent. `today` is the long-form PHT date.
    pub fn system_prompt(&self, today: &str) -> String {
        match self {
            Desk::Reservations => RESERVATION_SYSTEM_PROMPT.replace("{current_date_pht}", today),
            Desk::RoomService => ROOM_SERVICE_SYSTEM_PROMPT.to_string(),
        }
    }

    pub fn function_declarations(&self) -> Vec<Value> {
        match self {
            Desk::Reservations => reservation_declarations(),
            Desk::RoomService => room_service_declarations(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Scenario {
    pub id: &'static str,
    pub desk: Desk,
    pub description: &'static str,
    pub opening_prompt: &'static str,
    pub avatar: &'static str,
}

pub static SCENARIOS: [Scenario; 8] = [
    Scenario {
        id: "res1",
        desk: Desk::Reservations,
        description: "Standard booking for anniversary",
        opening_prompt: "Hello, I'd like to make a reservation for my anniversary.",
        avatar: "https://i.pravatar.cc/150?u=male1",
    },
    Scenario {
        id: "res2",
        desk: Desk::Reservations,
        description: "Group booking with a special request",
        opening_prompt: "Hi there, I need to make a reservation for a large group.",
        avatar: "https://i.pravatar.cc/150?u=female1",
    },
    Scenario {
        id: "res3",
        desk: Desk::Reservations,
        description: "Requesting a quiet table",
        opening_prompt: "Hi, I'd like to book a table for Saturday evening. Do you have anything quiet available, perhaps outdoors?",
        avatar: "https://i.pravatar.cc/150?u=male3",
    },
    Scenario {
        id: "res4",
        desk: Desk::Reservations,
        description: "Caller needs restaurant info",
        opening_prompt: "Hi, I have a couple of questions. What type of cuisine do you serve? Also, what's your dining style, is it formal?",
        avatar: "https://i.pravatar.cc/150?u=female3",
    },
    Scenario {
        id: "rs1",
        desk: Desk::RoomService,
        description: "Breakfast order with allergy",
        opening_prompt: "Hi, I'd like to order breakfast, but I have a gluten allergy. I am in room 501.",
        avatar: "https://i.pravatar.cc/150?u=female2",
    },
    Scenario {
        id: "rs2",
        desk: Desk::RoomService,
        description: "Late-night snack order",
        opening_prompt: "Hello, is it too late to get some room service? I'd love a steak and a coffee. My room number is 322.",
        avatar: "https://i.pravatar.cc/150?u=male2",
    },
    Scenario {
        id: "rs3",
        desk: Desk::RoomService,
        description: "Large order for a family",
        opening_prompt: "Hello, room service? I'd like to place an order for room 1205. We'll need two steaks, an omelet, and two fruit platters.",
        avatar: "https://i.pravatar.cc/150?u=family1",
    },
    Scenario {
        id: "rs4",
        desk: Desk::RoomService,
        description: "Caller with questions about menu items",
        opening_prompt: "Hi, I'm looking at the menu. Can you tell me what's in the Omelet Station? I'm in room 811.",
        avatar: "https://i.pravatar.cc/150?u=male4",
    },
];

pub fn find_scenario(id: &str) -> Option<&'static Scenario> {
    SCENARIOS.iter().find(|s| s.id == id)
}

pub fn scenarios_for(desk: Desk) -> impl Iterator<Item = &'static Scenario> {
    SCENARIOS.iter().filter(move |s| s.desk == desk)
}

fn pht(now: DateTime<Utc>) -> DateTime<FixedOffset> {
    FixedOffset::east_opt(PHT_OFFSET_SECS)
        .map(|offset| now.with_timezone(&offset))
        .unwrap_or_else(|| now.fixed_offset())
}

pub(crate) fn today_pht(now: DateTime<Utc>) -> NaiveDate {
    pht(now).date_naive()
}

/// e.g. "Saturday, June 14, 2025"
pub fn long_date_pht(now: DateTime<Utc>) -> String {
    pht(now).format("%A, %B %-d, %Y").to_string()
}

/// Desk state shared by every call the server hosts.
#[derive(Debug, Default, Clone)]
pub struct Desks {
    pub reservations: Arc<ReservationBook>,
    pub room_service: Arc<OrderLedger>,
}

impl Desks {
    pub fn new() -> Self {
        Self::default()
    }

    fn handler_for(&self, desk: Desk) -> Arc<dyn ToolHandler> {
        match desk {
            Desk::Reservations => self.reservations.clone(),
            Desk::RoomService => self.room_service.clone(),
        }
    }

    /// Build the plan for one call on `scenario`, dated as of `now`.
    pub fn plan_for(&self, scenario: &Scenario, now: DateTime<Utc>) -> CallPlan {
        let desk = scenario.desk;
        let system_instruction = format!(
            "{} Start the conversation by saying: \"{}\"",
            desk.system_prompt(&long_date_pht(now)),
            scenario.opening_prompt
        );

        CallPlan {
            scenario_id: scenario.id.to_string(),
            title: desk.title().to_string(),
            system_instruction,
            function_declarations: desk.function_declarations(),
            metric_labels: desk.metric_labels(),
            tool_handler: Some(self.handler_for(desk)),
        }
    }
}

const SEATING_PREFERENCE_DESCRIPTION: &str =
    "Customer seating preference, \"Smoking\" for outdoor or \"Non-smoking\" for indoor.";

fn reservation_declarations() -> Vec<Value> {
    vec![
        json!({
            "name": "makeReservation",
            "description": "Creates a new reservation in the system. The system will automatically assign the best available table.",
            "parameters": {
                "type": "OBJECT",
                "properties": {
                    "customerName": { "type": "STRING", "description": "Full name of the customer." },
                    "phone": { "type": "STRING", "description": "Contact phone number for the reservation." },
                    "guests": { "type": "NUMBER", "description": "The number of guests in the party." },
                    "date": { "type": "STRING", "description": "The date of the reservation in YYYY-MM-DD format." },
                    "time": { "type": "STRING", "description": "The time of the reservation (e.g., \"7:00 PM\")." },
                    "seatingPreference": { "type": "STRING", "description": SEATING_PREFERENCE_DESCRIPTION }
                },
                "required": ["customerName", "guests", "date", "time", "seatingPreference"]
            }
        }),
        json!({
            "name": "checkAvailability",
            "description": "Checks for available times and tables based on date, number of guests, and seating preference.",
            "parameters": {
                "type": "OBJECT",
                "properties": {
                    "date": { "type": "STRING", "description": "The date to check in YYYY-MM-DD format." },
                    "guests": { "type": "NUMBER", "description": "The number of guests needing a table." },
                    "seatingPreference": { "type": "STRING", "description": SEATING_PREFERENCE_DESCRIPTION }
                },
                "required": ["date", "guests", "seatingPreference"]
            }
        }),
        json!({
            "name": "getRestaurantInfo",
            "description": "Gets general information about the restaurant like hours and parking.",
            "parameters": { "type": "OBJECT", "properties": {} }
        }),
    ]
}

fn room_service_declarations() -> Vec<Value> {
    vec![
        json!({
            "name": "getMenuItems",
            "description": "Fetches menu items, optionally filtering by category or dietary needs like gluten-free.",
            "parameters": {
                "type": "OBJECT",
                "properties": {
                    "category": {
                        "type": "STRING",
                        "description": "The category of menu items to fetch (e.g., \"Appetizers\", \"Main Courses\")."
                    },
                    "isGlutenFree": {
                        "type": "BOOLEAN",
                        "description": "Set to true to only fetch gluten-free items."
                    }
                }
            }
        }),
        json!({
            "name": "placeOrder",
            "description": "Places a room service order for a specific room with a list of items.",
            "parameters": {
                "type": "OBJECT",
                "properties": {
                    "roomNumber": {
                        "type": "NUMBER",
                        "description": "The room number to deliver the order to."
                    },
                    "items": {
                        "type": "ARRAY",
                        "items": {
                            "type": "OBJECT",
                            "properties": {
                                "itemName": { "type": "STRING", "description": "Name of the menu item." },
                                "quantity": { "type": "NUMBER", "description": "Number of this item to order." }
                            },
                            "required": ["itemName", "quantity"]
                        },
                        "description": "A list of items to be included in the order."
                    }
                },
                "required": ["roomNumber", "items"]
            }
        }),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_long_date_uses_philippine_time() {
        // 20:30 UTC on the 13th is already the 14th in Manila
        let now = Utc.with_ymd_and_hms(2025, 6, 13, 20, 30, 0).unwrap();
        assert_eq!(long_date_pht(now), "Saturday, June 14, 2025");
        assert_eq!(today_pht(now), NaiveDate::from_ymd_opt(2025, 6, 14).unwrap());
    }

    #[test]
    fn test_catalog_splits_by_desk() {
        assert_eq!(scenarios_for(Desk::Reservations).count(), 4);
        assert_eq!(scenarios_for(Desk::RoomService).count(), 4);
        assert_eq!(find_scenario("rs3").map(|s| s.desk), Some(Desk::RoomService));
        assert!(find_scenario("res9").is_none());
    }

    #[test]
    fn test_reservation_plan() {
        let desks = Desks::new();
        let now = Utc.with_ymd_and_hms(2024, 11, 5, 2, 0, 0).unwrap();
        let plan = desks.plan_for(find_scenario("res1").unwrap(), now);

        assert_eq!(plan.scenario_id, "res1");
        assert_eq!(plan.title, "RESERVATION CALL SIMULATOR");
        assert_eq!(plan.metric_labels, vec!["Politeness", "Efficiency", "Accuracy"]);
        assert!(plan.system_instruction.contains("Today's date is Tuesday, November 5, 2024."));
        assert!(plan.system_instruction.ends_with(
            "Start the conversation by saying: \"Hello, I'd like to make a reservation for my anniversary.\""
        ));
        let names: Vec<&str> = plan
            .function_declarations
            .iter()
            .filter_map(|d| d["name"].as_str())
            .collect();
        assert_eq!(names, vec!["makeReservation", "checkAvailability", "getRestaurantInfo"]);
        assert!(plan.tool_handler.is_some());
    }

    #[tokio::test]
    async fn test_room_service_plan_routes_to_order_ledger() {
        let desks = Desks::new();
        let plan = desks.plan_for(find_scenario("rs2").unwrap(), Utc::now());
        assert_eq!(plan.metric_labels, vec!["Accuracy", "Upselling", "Resolution"]);
        assert!(!plan.system_instruction.contains("{current_date_pht}"));

        let handler = plan.tool_handler.unwrap();
        let args = json!({ "roomNumber": 322, "items": [{ "itemName": "Coffee", "quantity": 1 }] });
        handler.call("placeOrder", &args).await.unwrap();
        assert_eq!(desks.room_service.orders().len(), 1);
    }
}
