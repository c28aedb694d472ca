//! Background generation: turns update requests into downstream resources and
//! removes those resources when their policy, rule, trigger or source goes
//! away.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod cleanup;
mod controller;
mod engine;
mod error;
mod foreach;
mod generator;
pub mod report;
mod response;
mod strategy;

#[cfg(test)]
mod tests;

pub use self::{
    controller::GenerateController,
    engine::BasicEngine,
    error::{Error, Errors},
    generator::Generator,
    report::EphemeralReportWriter,
    response::{Action, GenerateResponse},
};
