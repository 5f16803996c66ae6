mod download;
mod files;
mod node;
mod search;

pub use download::download_file;
pub use files::{create_file, delete_file, get_file, transfer_file, update_file};
pub use node::{health, node_status};
pub use search::{search_files, similar_files};
