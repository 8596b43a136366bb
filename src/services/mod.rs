pub mod seats;
pub mod locks;
pub mod bookings;
pub mod expiry;
pub mod tickets;
