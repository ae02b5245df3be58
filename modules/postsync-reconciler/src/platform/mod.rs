mod apify;

pub use apify::ApifyPlatform;
