//! Request and response models of the deployment backend HTTP API

pub mod models;
