use mongodb::{bson::doc, Client, Database};
use tracing::{info, warn};

use crate::errors::{AppError, Result};

/// Connects to MongoDB and pings the target database before handing it out.
pub async fn get_db_client(database_url: &str, db_name: &str) -> Result<Database> {
    let client = Client::with_uri_str(database_url).await?;
    let db = client.database(db_name);

    match db.run_command(doc! { "ping": 1 }).await {
        Ok(_) => info!("✅ Connected to database: {}", db_name),
        Err(e) => {
            warn!("❌ Database '{}' is not reachable: {}", db_name, e);
            return Err(AppError::MongoDB(e));
        }
    }

    match db.list_collection_names().await {
        Ok(collections) if !collections.iter().any(|c| c == "transactions") => {
            warn!("⚠️ 'transactions' collection not found, it will be created on first insert");
        }
        Ok(_) => {}
        Err(e) => warn!("Could not list collections in '{}': {}", db_name, e),
    }

    Ok(db)
}
