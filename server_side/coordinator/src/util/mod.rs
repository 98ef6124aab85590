pub mod file_backed_json;
