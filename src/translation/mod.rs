// Translation: OpenAI Chat Completions <-> upstream CloudCode wire shape.

pub mod request;
pub mod response;
pub mod tools;

pub use request::translate_request;
