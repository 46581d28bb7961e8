pub mod mock_push_server;
