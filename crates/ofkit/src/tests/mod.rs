mod backend_process;
mod requests;
mod support;
