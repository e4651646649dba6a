pub mod url_validation;
pub use url_validation::{UrlValidationError, validate_api_url, validate_socket_url};
