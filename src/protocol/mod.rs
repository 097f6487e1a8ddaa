pub mod signaling;
