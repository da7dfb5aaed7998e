mod common;
mod lifecycle;
mod notifications;
mod store;
