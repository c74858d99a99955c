pub mod controller;
pub mod installer;
pub mod instance;
pub mod server;
pub mod services;

pub use controller::{
    Controller, ControllerConfig, ControllerEvent, ControllerHandle, ControllerState,
};
pub use installer::{ComponentInstaller, InstallRequest, LaunchSpec, LocalInstaller};
pub use instance::{InstanceConfig, claim_instance, run, run_claimed};
