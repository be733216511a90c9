//! Scenario tests for the pipeline executor

mod helpers;

mod abort;
mod context_and_guards;
mod credentials;
mod failure_policies;
mod notification;
