pub mod channels;
pub mod messages;
pub mod presence;
pub mod sketches;
pub mod users;
