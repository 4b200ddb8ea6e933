// Data models: the upstream CloudCode wire shape and the OpenAI-shaped
// ingress/egress surface.

pub mod openai;
pub mod upstream;

pub use openai::*;
pub use upstream::*;
