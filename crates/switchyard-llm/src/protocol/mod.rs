//! Native wire formats of backends that are not OpenAI-compatible

pub mod gemini;
