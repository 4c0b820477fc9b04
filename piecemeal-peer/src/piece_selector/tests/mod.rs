mod scenarios;
mod shared;
