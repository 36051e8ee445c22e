pub mod compute;
pub mod digitalocean;
pub mod lightsail;
pub mod object_store;
pub mod s3;
