pub mod user;
pub mod event;
pub mod seat;
pub mod category;
pub mod booking;
pub mod queue;

pub use user::User;
pub use event::Event;
pub use seat::{Seat, SeatAvailability, SeatPresentation, SeatStatus};
pub use category::TicketCategory;
pub use booking::{Booking, BookingDetails, BookingStatus, Ticket, TicketStatus};
pub use queue::{QueueStatus, ReservationExpiryEntry, TicketGenerationEntry};
