pub mod artifact;
pub mod health;
pub mod migration;
pub mod notification;
pub mod run;
