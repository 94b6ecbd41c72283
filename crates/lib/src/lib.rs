//! # Installer configuration modules
//!
//! This crate holds the configuration of a system being installed: its
//! users and groups, firewall, services and boot target, and its
//! subscription. Each area is a [`module::ConfigurationModule`] that
//! imports an installation description, notifies subscribers of every
//! property change, and hands out the tasks that apply the configuration
//! to the installed system.

pub mod bus;
pub mod cli;
pub mod config;
pub mod firewall;
pub mod kickstart;
pub mod module;
pub mod observable;
pub mod service_observer;
pub mod services;
pub mod subscription;
pub mod task;
pub mod users;
