//! Domain logic: request validation, event decoding and email dispatch

pub mod dispatch;
