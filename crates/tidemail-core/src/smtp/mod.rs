//! SMTP receive service

mod handler;

pub use handler::SmtpHandler;
