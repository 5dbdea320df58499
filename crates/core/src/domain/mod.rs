pub mod authority;
pub mod delegation;
pub mod purchase;
