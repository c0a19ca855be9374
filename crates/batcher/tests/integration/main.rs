mod keys;
mod window;
