mod helper;
mod meeting;
mod ws;
