pub mod camelify;
pub mod logger;
pub mod rate_limit;
pub mod snakeify;
