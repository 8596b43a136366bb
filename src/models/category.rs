use serde::Serialize;
use sqlx::FromRow;

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct TicketCategory {
    pub id: i64,
    pub event_id: i64,
    pub name: String,
    pub default_price_cents: i64,
    pub total_seats: i32,
    pub booked_seats: i32,
}

impl TicketCategory {
    /// Remaining sellable quantity. The counter is the only authority for
    /// this, with or without a seat map.
    pub fn available(&self) -> i32 {
        (self.total_seats - self.booked_seats).max(0)
    }

    pub fn can_fit(&self, quantity: i32) -> bool {
        quantity > 0 && quantity <= self.available()
    }
}
